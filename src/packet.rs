//! Mailbox packets.
//!
//! A packet is a fixed 40-byte header followed by up to
//! [`MAX_DATA_SIZE`] bytes of payload.  Every header field is a 32-bit
//! little-endian word:
//!
//! | Offset | Field     | Meaning                                        |
//! |--------|-----------|------------------------------------------------|
//! | 0x00   | `dest`    | Destination queue                              |
//! | 0x04   | `src`     | Source queue                                   |
//! | 0x08   | `dest_id` | Destination queue reference                    |
//! | 0x0C   | `src_id`  | Source queue reference                         |
//! | 0x10   | `len`     | Payload length in bytes                        |
//! | 0x14   | `id`      | Packet identification, echoed in the answer    |
//! | 0x18   | `state`   | Status / error code                            |
//! | 0x1C   | `cmd`     | Command code, bit 0 set in answers             |
//! | 0x20   | `ext`     | Extension (sequence) information               |
//! | 0x24   | `rout`    | Router reference                               |
//!
//! Payload semantics are up to the command, and not interpreted here.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec::Vec;

use crate::dpm::{le_u32, put_le_u32};
use crate::{Error, Result};

/// Size of a packet header
pub const PACKET_HEADER_SIZE: usize = 40;
/// Largest packet, header included, host and device agree on
pub const MAX_PACKET_SIZE: usize = 1596;
/// Largest payload
pub const MAX_DATA_SIZE: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;
/// Set in the command code of an answer
pub const ANSWER_BIT: u32 = 0x0000_0001;

/// Packet header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub dest: u32,
    pub src: u32,
    pub dest_id: u32,
    pub src_id: u32,
    pub len: u32,
    pub id: u32,
    pub state: u32,
    pub cmd: u32,
    pub ext: u32,
    pub rout: u32,
}

/// PacketHeader offsets
impl PacketHeader {
    pub const DEST: usize = 0x00;
    pub const SRC: usize = 0x04;
    pub const DEST_ID: usize = 0x08;
    pub const SRC_ID: usize = 0x0C;
    pub const LEN: usize = 0x10;
    pub const ID: usize = 0x14;
    pub const STATE: usize = 0x18;
    pub const CMD: usize = 0x1C;
    pub const EXT: usize = 0x20;
    pub const ROUT: usize = 0x24;

    /// Write the header into the first [`PACKET_HEADER_SIZE`] bytes of `buf`
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(Error::InvalidBufferSize);
        }
        put_le_u32(buf, Self::DEST, self.dest);
        put_le_u32(buf, Self::SRC, self.src);
        put_le_u32(buf, Self::DEST_ID, self.dest_id);
        put_le_u32(buf, Self::SRC_ID, self.src_id);
        put_le_u32(buf, Self::LEN, self.len);
        put_le_u32(buf, Self::ID, self.id);
        put_le_u32(buf, Self::STATE, self.state);
        put_le_u32(buf, Self::CMD, self.cmd);
        put_le_u32(buf, Self::EXT, self.ext);
        put_le_u32(buf, Self::ROUT, self.rout);
        Ok(())
    }

    /// Read a header from the first [`PACKET_HEADER_SIZE`] bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(Error::InvalidBufferSize);
        }
        Ok(Self {
            dest: le_u32(buf, Self::DEST),
            src: le_u32(buf, Self::SRC),
            dest_id: le_u32(buf, Self::DEST_ID),
            src_id: le_u32(buf, Self::SRC_ID),
            len: le_u32(buf, Self::LEN),
            id: le_u32(buf, Self::ID),
            state: le_u32(buf, Self::STATE),
            cmd: le_u32(buf, Self::CMD),
            ext: le_u32(buf, Self::EXT),
            rout: le_u32(buf, Self::ROUT),
        })
    }

    /// Whether this is the answer to `request`: same command (ignoring the
    /// answer bit), source, id and source id.
    pub fn answers(&self, request: &PacketHeader) -> bool {
        (self.cmd & !ANSWER_BIT) == (request.cmd & !ANSWER_BIT)
            && self.src == request.src
            && self.id == request.id
            && self.src_id == request.src_id
    }
}

/// A packet: header plus payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a packet carrying `data`, with the header length set to match.
    pub fn new(header: PacketHeader, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_DATA_SIZE {
            return Err(Error::InvalidBufferSize);
        }
        let mut header = header;
        header.len = data.len() as u32;
        Ok(Self {
            header,
            data: data.to_vec(),
        })
    }

    /// Create a request packet with no payload
    pub fn request(dest: u32, cmd: u32, id: u32) -> Self {
        Self {
            header: PacketHeader {
                dest,
                cmd,
                id,
                ..Default::default()
            },
            data: Vec::new(),
        }
    }

    /// Bytes this packet occupies in a mailbox, per its header.  `None` if
    /// the declared length does not fit in a `usize`.
    pub fn wire_len(&self) -> Option<usize> {
        PACKET_HEADER_SIZE.checked_add(self.header.len as usize)
    }

    /// Serialize header and the declared payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.header.len as usize;
        if len > self.data.len() {
            return Err(Error::InvalidBufferSize);
        }
        let mut frame = alloc::vec![0u8; PACKET_HEADER_SIZE + len];
        self.header.encode(&mut frame)?;
        frame[PACKET_HEADER_SIZE..].copy_from_slice(&self.data[..len]);
        Ok(frame)
    }

    /// Deserialize from a buffer holding at least a header.  Payload beyond
    /// the buffer is dropped and `len` left as declared.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(buf)?;
        let end = PACKET_HEADER_SIZE
            .saturating_add(header.len as usize)
            .min(buf.len());
        Ok(Self {
            header,
            data: buf[PACKET_HEADER_SIZE..end].to_vec(),
        })
    }

    pub fn is_answer(&self) -> bool {
        self.header.cmd & ANSWER_BIT != 0
    }
}

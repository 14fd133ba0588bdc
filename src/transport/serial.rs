//! DPM over a serial (SPI) link.
//!
//! The controller exposes its DPM through an SPI slave interface.  Each chip
//! family frames its transactions differently:
//!
//! | Family   | Command byte             | Address       | Length        | Chunk   | Alignment |
//! |----------|--------------------------|---------------|---------------|---------|-----------|
//! | netX10   | R/W flag + address 19:16 | 2 bytes       | separate byte | 255     | none      |
//! | netX50   | R/W flag + length        | 2 bytes       | in command    | 64      | none      |
//! | netX100  | `0x03` read, `0x02` write| 3 bytes       | CS framed     | any     | 4 bytes   |
//! | netX4000 | `0x0B` read, `0x02` write| 4 bytes       | CS framed     | any     | none      |
//!
//! netX10 and netX4000 reads carry one turnaround byte between header and
//! data.
//!
//! [`SerialDpm::detect()`] classifies the chip by sending two probes, one per
//! candidate command encoding, and matching the status windows they return
//! against the known signatures.  The family's read/write functions are then
//! fixed for the lifetime of the transport.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::transport::Transport;
use crate::{Error, Result};

/// SPI bus carrying the serial DPM protocol.
pub trait SpiBus: Send {
    /// The error type returned by the bus.
    type Error: core::fmt::Debug;

    /// Perform one full-duplex transaction, with chip select asserted for its
    /// whole length.  The bytes in `buf` are sent, and replaced by the bytes
    /// received.
    fn transfer(&mut self, buf: &mut [u8]) -> core::result::Result<(), Self::Error>;
}

/// Controller families with a serial DPM interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    Netx10,
    Netx50,
    Netx100,
    Netx4000,
}

impl ChipFamily {
    /// Reads needed after detection before the chip returns valid data
    pub const fn primer_reads(self) -> usize {
        match self {
            ChipFamily::Netx10 => 2,
            ChipFamily::Netx50 => 1,
            ChipFamily::Netx100 | ChipFamily::Netx4000 => 0,
        }
    }

    fn backend<B: SpiBus>(self) -> Backend<B> {
        match self {
            ChipFamily::Netx10 => Backend {
                read: netx10::read::<B>,
                write: netx10::write::<B>,
            },
            ChipFamily::Netx50 => Backend {
                read: netx50::read::<B>,
                write: netx50::write::<B>,
            },
            ChipFamily::Netx100 => Backend {
                read: netx100::read::<B>,
                write: netx100::write::<B>,
            },
            ChipFamily::Netx4000 => Backend {
                read: netx4000::read::<B>,
                write: netx4000::write::<B>,
            },
        }
    }
}

/// Detection passes before giving up
const DETECT_PASSES: usize = 2;

/// Probe using the address-in-command encoding: read 4 bytes at 0.  The
/// status window is the last two bytes.
pub(crate) const PROBE_ADDR_IN_CMD: [u8; 6] = [0x80, 0x00, 0x00, 0x04, 0x00, 0x00];
/// Probe using the length-in-command encoding: read 4 bytes at 0.  The status
/// window is the last two bytes.
pub(crate) const PROBE_LEN_IN_CMD: [u8; 5] = [0x84, 0x00, 0x00, 0x00, 0x00];

/// Detection pattern: address-in-command status window in the upper half,
/// length-in-command status window in the lower.  A chip that did not decode
/// a probe leaves the bus floating high.
const SIGNATURES: [(u32, ChipFamily); 4] = [
    (0x0A10_FFFF, ChipFamily::Netx10),
    (0xFFFF_0A50, ChipFamily::Netx50),
    (0x0A64_0A64, ChipFamily::Netx100),
    (0x0FA0_FFFF, ChipFamily::Netx4000),
];

const READ_FLAG: u8 = 0x80;

type ReadFn<B> = fn(&mut B, u32, &mut [u8]) -> Result<()>;
type WriteFn<B> = fn(&mut B, u32, &[u8]) -> Result<()>;

struct Backend<B> {
    read: ReadFn<B>,
    write: WriteFn<B>,
}

fn transfer<B: SpiBus>(bus: &mut B, frame: &mut [u8]) -> Result<()> {
    bus.transfer(frame).map_err(|e| {
        warn!("SPI transfer failed: {e:?}");
        Error::Io
    })
}

/// Classify a detection pattern
pub(crate) fn classify(pattern: u32) -> Option<ChipFamily> {
    SIGNATURES
        .iter()
        .find(|(signature, _)| *signature == pattern)
        .map(|(_, family)| *family)
}

fn probe<B: SpiBus>(bus: &mut B) -> Result<u32> {
    let mut a = PROBE_ADDR_IN_CMD;
    transfer(bus, &mut a)?;
    let mut b = PROBE_LEN_IN_CMD;
    transfer(bus, &mut b)?;

    let high = u16::from_be_bytes([a[a.len() - 2], a[a.len() - 1]]) as u32;
    let low = u16::from_be_bytes([b[b.len() - 2], b[b.len() - 1]]) as u32;
    Ok((high << 16) | low)
}

/// [`Transport`] over a serial DPM.
pub struct SerialDpm<B: SpiBus> {
    bus: Mutex<B>,
    family: ChipFamily,
    backend: Backend<B>,
}

impl<B: SpiBus> SerialDpm<B> {
    /// Detect the chip family on `bus` and create the transport.
    ///
    /// Runs up to two detection passes, as some chips return garbage to the
    /// first transactions after power-up, then issues the family's primer
    /// reads.
    pub fn detect(mut bus: B) -> Result<Self> {
        for pass in 0..DETECT_PASSES {
            let pattern = probe(&mut bus)?;
            match classify(pattern) {
                Some(family) => {
                    debug!("Detected serial DPM {family:?} (pattern {pattern:#010X})");
                    let dpm = Self::with_family(bus, family);
                    dpm.prime()?;
                    return Ok(dpm);
                }
                None => {
                    debug!("Serial DPM detection pass {pass}: unknown pattern {pattern:#010X}")
                }
            }
        }

        warn!("No serial DPM detected");
        Err(Error::UnknownChip)
    }

    /// Create the transport for a known chip family, without detection or
    /// primer reads.
    pub fn with_family(bus: B, family: ChipFamily) -> Self {
        Self {
            bus: Mutex::new(bus),
            family,
            backend: family.backend(),
        }
    }

    pub fn family(&self) -> ChipFamily {
        self.family
    }

    /// Give back the bus
    pub fn into_inner(self) -> B {
        self.bus.into_inner()
    }

    fn prime(&self) -> Result<()> {
        let mut bus = self.bus.lock();
        for _ in 0..self.family.primer_reads() {
            let mut dummy = [0u8; 4];
            (self.backend.read)(&mut *bus, 0, &mut dummy)?;
        }
        Ok(())
    }
}

impl<B: SpiBus> Transport for SerialDpm<B> {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut bus = self.bus.lock();
        (self.backend.read)(&mut *bus, offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut bus = self.bus.lock();
        (self.backend.write)(&mut *bus, offset, data)
    }
}

/// Write `data` at `addr` on a bus that only accepts whole, aligned words.
///
/// The request is split into an unaligned head (read word, splice, write
/// word), an aligned middle written directly, and an unaligned tail (read
/// word, splice, write word).  Bytes outside `addr..addr + data.len()` are
/// written back unchanged.
fn write_aligned<B: SpiBus>(
    bus: &mut B,
    addr: u32,
    data: &[u8],
    read_words: ReadFn<B>,
    write_words: WriteFn<B>,
) -> Result<()> {
    let mut addr = addr;
    let mut done = 0;

    let head = (addr % 4) as usize;
    if head != 0 {
        let base = addr - head as u32;
        let count = (4 - head).min(data.len());
        let mut word = [0u8; 4];
        read_words(bus, base, &mut word)?;
        word[head..head + count].copy_from_slice(&data[..count]);
        write_words(bus, base, &word)?;
        done += count;
        addr = base + 4;
    }

    let bulk = (data.len() - done) & !3;
    if bulk > 0 {
        write_words(bus, addr, &data[done..done + bulk])?;
        done += bulk;
        addr += bulk as u32;
    }

    let tail = data.len() - done;
    if tail > 0 {
        let mut word = [0u8; 4];
        read_words(bus, addr, &mut word)?;
        word[..tail].copy_from_slice(&data[done..]);
        write_words(bus, addr, &word)?;
    }

    Ok(())
}

/// Read `buf.len()` bytes at `addr` on a bus that only accepts whole, aligned
/// words, by reading the enclosing aligned window.
fn read_aligned<B: SpiBus>(
    bus: &mut B,
    addr: u32,
    buf: &mut [u8],
    read_words: ReadFn<B>,
) -> Result<()> {
    let head = (addr % 4) as usize;
    let base = addr - head as u32;
    let window = (head + buf.len()).div_ceil(4) * 4;
    if head == 0 && window == buf.len() {
        return read_words(bus, base, buf);
    }
    let mut words = vec![0u8; window];
    read_words(bus, base, &mut words)?;
    buf.copy_from_slice(&words[head..head + buf.len()]);
    Ok(())
}

mod netx10 {
    use super::*;

    const MAX_CHUNK: usize = 255;
    const HEADER: usize = 4;
    const TURNAROUND: usize = 1;
    const MAX_ADDR: u32 = 0x000F_FFFF;

    fn header(read: bool, addr: u32, len: usize) -> Result<[u8; HEADER]> {
        if addr.saturating_add(len as u32) > MAX_ADDR + 1 {
            return Err(Error::InvalidParameter);
        }
        let flag = if read { READ_FLAG } else { 0 };
        Ok([
            flag | ((addr >> 16) & 0x0F) as u8,
            (addr >> 8) as u8,
            addr as u8,
            len as u8,
        ])
    }

    pub(super) fn read<B: SpiBus>(bus: &mut B, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut addr = addr;
        for chunk in buf.chunks_mut(MAX_CHUNK) {
            let mut frame = vec![0u8; HEADER + TURNAROUND + chunk.len()];
            frame[..HEADER].copy_from_slice(&header(true, addr, chunk.len())?);
            transfer(bus, &mut frame)?;
            chunk.copy_from_slice(&frame[HEADER + TURNAROUND..]);
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    pub(super) fn write<B: SpiBus>(bus: &mut B, addr: u32, data: &[u8]) -> Result<()> {
        let mut addr = addr;
        for chunk in data.chunks(MAX_CHUNK) {
            let mut frame = vec![0u8; HEADER + chunk.len()];
            frame[..HEADER].copy_from_slice(&header(false, addr, chunk.len())?);
            frame[HEADER..].copy_from_slice(chunk);
            transfer(bus, &mut frame)?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }
}

mod netx50 {
    use super::*;

    const CHUNK: usize = 64;
    const HEADER: usize = 3;
    const MAX_ADDR: u32 = 0xFFFF;

    fn header(read: bool, addr: u32, len: usize) -> Result<[u8; HEADER]> {
        if addr.saturating_add(len as u32) > MAX_ADDR + 1 {
            return Err(Error::InvalidParameter);
        }
        let flag = if read { READ_FLAG } else { 0 };
        Ok([flag | len as u8, (addr >> 8) as u8, addr as u8])
    }

    pub(super) fn read<B: SpiBus>(bus: &mut B, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut addr = addr;
        for chunk in buf.chunks_mut(CHUNK) {
            let mut frame = [0u8; HEADER + CHUNK];
            let frame = &mut frame[..HEADER + chunk.len()];
            frame[..HEADER].copy_from_slice(&header(true, addr, chunk.len())?);
            transfer(bus, frame)?;
            chunk.copy_from_slice(&frame[HEADER..]);
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    pub(super) fn write<B: SpiBus>(bus: &mut B, addr: u32, data: &[u8]) -> Result<()> {
        let mut addr = addr;
        for chunk in data.chunks(CHUNK) {
            let mut frame = [0u8; HEADER + CHUNK];
            let frame = &mut frame[..HEADER + chunk.len()];
            frame[..HEADER].copy_from_slice(&header(false, addr, chunk.len())?);
            frame[HEADER..].copy_from_slice(chunk);
            transfer(bus, frame)?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }
}

mod netx100 {
    use super::*;

    const CMD_READ: u8 = 0x03;
    const CMD_WRITE: u8 = 0x02;
    const HEADER: usize = 4;
    const MAX_ADDR: u32 = 0x00FF_FFFF;

    fn header(cmd: u8, addr: u32) -> Result<[u8; HEADER]> {
        if addr > MAX_ADDR {
            return Err(Error::InvalidParameter);
        }
        Ok([cmd, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8])
    }

    fn read_words<B: SpiBus>(bus: &mut B, addr: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert!(addr % 4 == 0 && buf.len() % 4 == 0);
        let mut frame = vec![0u8; HEADER + buf.len()];
        frame[..HEADER].copy_from_slice(&header(CMD_READ, addr)?);
        transfer(bus, &mut frame)?;
        buf.copy_from_slice(&frame[HEADER..]);
        Ok(())
    }

    fn write_words<B: SpiBus>(bus: &mut B, addr: u32, data: &[u8]) -> Result<()> {
        debug_assert!(addr % 4 == 0 && data.len() % 4 == 0);
        let mut frame = vec![0u8; HEADER + data.len()];
        frame[..HEADER].copy_from_slice(&header(CMD_WRITE, addr)?);
        frame[HEADER..].copy_from_slice(data);
        transfer(bus, &mut frame)
    }

    pub(super) fn read<B: SpiBus>(bus: &mut B, addr: u32, buf: &mut [u8]) -> Result<()> {
        read_aligned(bus, addr, buf, read_words::<B>)
    }

    pub(super) fn write<B: SpiBus>(bus: &mut B, addr: u32, data: &[u8]) -> Result<()> {
        write_aligned(bus, addr, data, read_words::<B>, write_words::<B>)
    }
}

mod netx4000 {
    use super::*;

    const CMD_READ: u8 = 0x0B;
    const CMD_WRITE: u8 = 0x02;
    const HEADER: usize = 5;
    const TURNAROUND: usize = 1;

    fn header(cmd: u8, addr: u32) -> [u8; HEADER] {
        let a = addr.to_be_bytes();
        [cmd, a[0], a[1], a[2], a[3]]
    }

    pub(super) fn read<B: SpiBus>(bus: &mut B, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut frame = vec![0u8; HEADER + TURNAROUND + buf.len()];
        frame[..HEADER].copy_from_slice(&header(CMD_READ, addr));
        transfer(bus, &mut frame)?;
        buf.copy_from_slice(&frame[HEADER + TURNAROUND..]);
        Ok(())
    }

    pub(super) fn write<B: SpiBus>(bus: &mut B, addr: u32, data: &[u8]) -> Result<()> {
        let mut frame = vec![0u8; HEADER + data.len()];
        frame[..HEADER].copy_from_slice(&header(CMD_WRITE, addr));
        frame[HEADER..].copy_from_slice(data);
        transfer(bus, &mut frame)
    }
}

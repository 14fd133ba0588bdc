//! Packet exchange through a channel's mailboxes.
//!
//! Each channel has a send mailbox (host to device) and a receive mailbox
//! (device to host), each holding one packet at a time:
//!
//! - The send mailbox is free while its handshake bit pair is equal.  The host
//!   copies a packet in and toggles its copy of the bit.  The device toggles
//!   its copy back once it has taken the packet.
//! - A packet is waiting in the receive mailbox while the pair is unequal.
//!   The host copies it out and toggles its copy to hand the mailbox back.
//!
//! [`ChannelRef::transfer_packet()`] combines the two into a request/answer
//! exchange.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::Ordering;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use spin::MutexGuard;

use crate::channel::{BitState, ChannelRef, Mailbox};
use crate::dpm::bit_mask;
use crate::os::{self, Os};
use crate::packet::{PACKET_HEADER_SIZE, Packet, PacketHeader};
use crate::{Error, Result};

/// Mailbox fill state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxState {
    /// Packets the device has queued for the host, including the one in the
    /// receive mailbox
    pub recv_waiting: u16,
    /// Packets the device will currently accept through the send mailbox
    pub send_accepted: u16,
}

impl<O: Os> ChannelRef<'_, O> {
    /// Take the mailbox's caller lock within `timeout_ms`, returning the
    /// guard and whatever is left of the timeout.
    fn lock_mailbox<'m>(
        &self,
        mbx: &'m Mailbox,
        timeout_ms: u32,
    ) -> Result<(MutexGuard<'m, ()>, u32)> {
        let os = self.os();
        let start = os.tick_ms();
        let guard = os::lock_timeout(os, &mbx.lock, timeout_ms)?;
        let left = (timeout_ms as u64).saturating_sub(os::elapsed_ms(os, start)) as u32;
        Ok((guard, left))
    }

    /// Place `packet` in the send mailbox.
    ///
    /// Waits up to `timeout_ms` for the mailbox to be free.  The packet is
    /// checked against the mailbox capacity before anything is written.
    /// Concurrent callers are served one at a time; one that cannot get its
    /// turn within `timeout_ms` fails with [`Error::Busy`].
    pub fn put_packet(&self, packet: &Packet, timeout_ms: u32) -> Result<()> {
        let mbx = &self.channel.send_mbx;

        if !self.is_ready()? {
            return Err(Error::NotReady);
        }
        let len = packet.wire_len();
        if len.is_none_or(|len| len > mbx.size as usize) {
            debug!(
                "{}: packet of {} payload bytes exceeds send mailbox of {} bytes",
                self.device.name(),
                packet.header.len,
                mbx.size
            );
            return Err(Error::MailboxTooShort);
        }
        let frame = packet.encode()?;

        let (_turn, left) = self.lock_mailbox(mbx, timeout_ms)?;
        if !self.wait_for_bit_state(mbx.bit, BitState::Equal, left)? {
            return Err(Error::MailboxFull);
        }

        self.transport().write(mbx.data, &frame)?;
        mbx.packets.fetch_add(1, Ordering::Relaxed);

        let mut st = self.lock_state();
        self.toggle_bit_locked(&mut st, bit_mask(mbx.bit))?;
        trace!(
            "{}: put packet cmd {:#010X} len {}",
            self.device.name(),
            packet.header.cmd,
            packet.header.len
        );
        Ok(())
    }

    /// Take a packet from the receive mailbox into `buf`, returning the
    /// number of bytes copied.
    ///
    /// Waits up to `timeout_ms` for a packet.  If the packet does not fit,
    /// `buf` receives as much as fits, the mailbox is still handed back to
    /// the device, and [`Error::BufferTooShort`] is returned.  A packet
    /// whose header claims more than the mailbox holds is handed back with
    /// only its header copied, and [`Error::MailboxTooShort`] is returned.
    pub fn get_packet(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let mbx = &self.channel.recv_mbx;

        if buf.len() < PACKET_HEADER_SIZE {
            return Err(Error::InvalidBufferSize);
        }
        if !self.is_ready()? {
            return Err(Error::NotReady);
        }

        let (_turn, left) = self.lock_mailbox(mbx, timeout_ms)?;
        if !self.wait_for_bit_state(mbx.bit, BitState::NotEqual, left)? {
            return Err(Error::NoPacket);
        }

        self.transport()
            .read(mbx.data, &mut buf[..PACKET_HEADER_SIZE])?;
        let header = PacketHeader::decode(buf)?;
        let declared = PACKET_HEADER_SIZE
            .checked_add(header.len as usize)
            .filter(|&len| len <= mbx.size as usize);
        let copied = match declared {
            Some(declared) => declared.min(buf.len()),
            None => PACKET_HEADER_SIZE,
        };
        if copied > PACKET_HEADER_SIZE {
            self.transport().read(
                mbx.data + PACKET_HEADER_SIZE as u32,
                &mut buf[PACKET_HEADER_SIZE..copied],
            )?;
        }
        mbx.packets.fetch_add(1, Ordering::Relaxed);

        {
            let mut st = self.lock_state();
            self.toggle_bit_locked(&mut st, bit_mask(mbx.bit))?;
        }

        trace!(
            "{}: got packet cmd {:#010X} len {}",
            self.device.name(),
            header.cmd,
            header.len
        );
        let Some(declared) = declared else {
            error!(
                "{}: packet cmd {:#010X} claims {} payload bytes, mailbox holds {}",
                self.device.name(),
                header.cmd,
                header.len,
                mbx.size
            );
            return Err(Error::MailboxTooShort);
        };
        if copied < declared {
            warn!(
                "{}: packet of {declared} bytes truncated to {copied}",
                self.device.name()
            );
            return Err(Error::BufferTooShort);
        }
        Ok(copied)
    }

    /// Take a packet from the receive mailbox
    pub fn recv_packet(&self, timeout_ms: u32) -> Result<Packet> {
        let size = (self.channel.recv_mbx.size as usize).max(PACKET_HEADER_SIZE);
        let mut buf = alloc::vec![0u8; size];
        let len = self.get_packet(&mut buf, timeout_ms)?;
        Packet::decode(&buf[..len])
    }

    /// Send `request` and wait for its answer.
    ///
    /// Packets arriving in the meantime that do not answer `request` are
    /// passed to `unsolicited`, if given, and otherwise dropped.  Gives up
    /// with [`Error::GetTimeout`] when no packet arrives within `timeout_ms`,
    /// or once the configured number of packets has been inspected without
    /// finding the answer.
    pub fn transfer_packet(
        &self,
        request: &Packet,
        timeout_ms: u32,
        mut unsolicited: Option<&mut dyn FnMut(&Packet)>,
    ) -> Result<Packet> {
        self.put_packet(request, timeout_ms)?;

        for _ in 0..self.device.config().transfer_retries {
            let packet = match self.recv_packet(timeout_ms) {
                Ok(packet) => packet,
                Err(Error::NoPacket) => return Err(Error::GetTimeout),
                Err(e) => return Err(e),
            };
            if packet.header.answers(&request.header) {
                return Ok(packet);
            }
            debug!(
                "{}: unsolicited packet cmd {:#010X} while waiting for {:#010X}",
                self.device.name(),
                packet.header.cmd,
                request.header.cmd
            );
            if let Some(callback) = unsolicited.as_mut() {
                callback(&packet);
            }
        }

        warn!(
            "{}: no answer to cmd {:#010X}",
            self.device.name(),
            request.header.cmd
        );
        Err(Error::GetTimeout)
    }

    /// Current mailbox fill state, from the device's packet counters
    pub fn mailbox_state(&self) -> Result<MailboxState> {
        Ok(MailboxState {
            recv_waiting: self.transport().read_u16(self.channel.recv_mbx.counter)?,
            send_accepted: self.transport().read_u16(self.channel.send_mbx.counter)?,
        })
    }
}

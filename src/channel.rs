//! Channel instances and the handshake engine.
//!
//! A [`Channel`] is either the system channel or a communication channel.  It
//! holds the descriptors worked out at attach time (mailboxes, IO areas, COS
//! word locations, handshake cell) and the cached copies of both halves of its
//! handshake cell.
//!
//! All mutation of the cached flags, and every write of the host flags word to
//! the DPM, happens with the channel's state lock held.  The host flags word
//! is only ever changed by XOR-ing a mask in and writing the whole word back
//! ([`ChannelRef::toggle_bit()`]).
//!
//! Channels are owned by their [`Device`] and handed out as [`ChannelRef`]s,
//! which pair the channel with its device.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::device::{Device, DmaBuffer};
use crate::dpm::{
    self, ChannelInfo, CommCos, CommonStatus, HandshakeWidth, NetxSysFlags, bit_mask,
    comm_channel, common_status, handshake_cell_offset, system_control, system_status,
};
use crate::io::{IoArea, IoAreaId};
use crate::os::{self, Event, Os};
use crate::transport::Transport;
use crate::{Error, Result};

/// Which channel this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    System,
    /// Communication channel, numbered from 0
    Communication(u8),
}

/// Handshake bit condition.
///
/// `Clear` and `Set` test the device's copy of the bit alone.  `Equal` and
/// `NotEqual` compare the host's and the device's copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    Clear,
    Set,
    Equal,
    NotEqual,
}

/// Event reported to registered notification callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The device placed a packet in the receive mailbox
    RecvMailboxFull { waiting: u16 },
    /// The device took the packet from the send mailbox
    SendMailboxEmpty,
    /// An IO area became available to the host
    IoArea { area: IoAreaId },
    /// The device started or stopped communicating
    ComState { communicating: bool },
    /// The device changed its COS flags
    CosChanged { cos: CommCos, changed: CommCos },
}

/// Notification kinds, for registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    RecvMailboxFull,
    SendMailboxEmpty,
    IoArea,
    ComState,
    CosChanged,
}

impl Notification {
    pub fn kind(&self) -> NotifyKind {
        match self {
            Notification::RecvMailboxFull { .. } => NotifyKind::RecvMailboxFull,
            Notification::SendMailboxEmpty => NotifyKind::SendMailboxEmpty,
            Notification::IoArea { .. } => NotifyKind::IoArea,
            Notification::ComState { .. } => NotifyKind::ComState,
            Notification::CosChanged { .. } => NotifyKind::CosChanged,
        }
    }
}

/// Notification callback
pub type NotifyFn = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Mailbox descriptor
#[derive(Debug)]
pub(crate) struct Mailbox {
    /// Absolute offset of the 16-bit packet counter the device maintains
    pub(crate) counter: u32,
    /// Absolute offset of the packet data
    pub(crate) data: u32,
    /// Capacity in bytes, packet header included
    pub(crate) size: u32,
    /// Handshake bit guarding the mailbox
    pub(crate) bit: u8,
    /// Packets the host has passed through this mailbox
    pub(crate) packets: AtomicU32,
    /// Held by a caller from the handshake wait through the toggle
    pub(crate) lock: Mutex<()>,
}

impl Mailbox {
    fn new(start: u32, size: u32, bit: u8) -> Self {
        Self {
            counter: start + dpm::mailbox::COUNTER,
            data: start + dpm::mailbox::DATA,
            size,
            bit,
            packets: AtomicU32::new(0),
            lock: Mutex::new(()),
        }
    }
}

/// Cached handshake and COS state of a channel.  Guarded by the channel's
/// state lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlagState {
    /// Host half of the handshake cell, as last written
    pub(crate) host_flags: u16,
    /// Device half of the handshake cell, as last read
    pub(crate) netx_flags: u16,
    /// Host COS flags to be written with the next COS command
    pub(crate) host_cos: u32,
    /// Host COS flags as last written
    pub(crate) last_host_cos: u32,
    /// One-shot enable bits of a deferred COS change
    pub(crate) pending_post_clear: u32,
    /// A COS change is waiting for the command bit
    pub(crate) cos_pending: bool,
    /// Device COS flags, as last read
    pub(crate) device_cos: u32,
    /// Bits that changed in the last device COS update
    pub(crate) device_cos_changed: u32,
}

impl FlagState {
    pub(crate) fn bit_state(&self, bit: u8, state: BitState) -> bool {
        let mask = bit_mask(bit);
        match state {
            BitState::Clear => self.netx_flags & mask == 0,
            BitState::Set => self.netx_flags & mask != 0,
            BitState::Equal => (self.host_flags ^ self.netx_flags) & mask == 0,
            BitState::NotEqual => (self.host_flags ^ self.netx_flags) & mask != 0,
        }
    }
}

/// A channel of a device
pub struct Channel<O: Os> {
    pub(crate) kind: ChannelKind,
    pub(crate) block_id: u8,
    pub(crate) base: u32,
    pub(crate) size: u32,
    pub(crate) width: HandshakeWidth,
    pub(crate) cell: u32,
    pub(crate) send_mbx: Mailbox,
    pub(crate) recv_mbx: Mailbox,
    pub(crate) host_cos_offset: u32,
    pub(crate) netx_cos_offset: u32,
    pub(crate) io_areas: Vec<IoArea>,
    pub(crate) info: Option<ChannelInfo>,
    pub(crate) state: Mutex<FlagState>,
    pub(crate) init_lock: Mutex<()>,
    pub(crate) dma: Mutex<[Option<DmaBuffer>; 2]>,
    pub(crate) events: Vec<O::Event>,
    callbacks: Mutex<Vec<(NotifyKind, NotifyFn)>>,
}

impl<O: Os> Channel<O> {
    fn events(os: &O) -> Vec<O::Event> {
        (0..dpm::HANDSHAKE_BITS).map(|_| os.create_event()).collect()
    }

    /// The system channel: block 0, 8-bit handshake, fixed layout
    pub(crate) fn system(os: &O) -> Self {
        let mbx_size = dpm::mailbox::SYSTEM_SIZE;
        Self {
            kind: ChannelKind::System,
            block_id: dpm::SYSTEM_BLOCK_ID,
            base: dpm::SYSTEM_CHANNEL_OFFSET,
            size: dpm::SYSTEM_CHANNEL_SIZE,
            width: HandshakeWidth::Bits8,
            cell: handshake_cell_offset(dpm::SYSTEM_BLOCK_ID),
            send_mbx: Mailbox::new(dpm::mailbox::SYSTEM_SEND, mbx_size, dpm::SEND_MBX_BIT),
            recv_mbx: Mailbox::new(dpm::mailbox::SYSTEM_RECV, mbx_size, dpm::RECV_MBX_BIT),
            host_cos_offset: system_control::COMMAND_COS,
            netx_cos_offset: system_status::SYSTEM_COS,
            io_areas: Vec::new(),
            info: None,
            state: Mutex::new(FlagState::default()),
            init_lock: Mutex::new(()),
            dma: Mutex::new([None; 2]),
            events: Self::events(os),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// A communication channel at `base`, laid out per its information
    /// block.  The IO handshake modes are taken from its common status block.
    pub(crate) fn communication(
        os: &O,
        transport: &dyn Transport,
        number: u8,
        block_id: u8,
        base: u32,
        info: ChannelInfo,
    ) -> Result<Self> {
        if block_id as usize >= dpm::MAX_HANDSHAKE_CELLS {
            return Err(Error::InvalidChannel);
        }
        let mbx_size = info.mailbox_size as u32;
        let send = base + comm_channel::SEND_MAILBOX;
        let recv = send + dpm::mailbox::HEADER_SIZE + mbx_size;
        let end = base + info.channel_size;

        let mut status = [0u8; common_status::SIZE];
        transport.read(base + comm_channel::COMMON_STATUS, &mut status)?;
        let status = CommonStatus::decode(&status)?;
        let io_areas = IoArea::layout(
            recv + dpm::mailbox::HEADER_SIZE + mbx_size,
            end,
            status.pd_in_handshake_mode,
            status.pd_out_handshake_mode,
        );

        Ok(Self {
            kind: ChannelKind::Communication(number),
            block_id,
            base,
            size: info.channel_size,
            width: info.handshake_width,
            cell: handshake_cell_offset(block_id),
            send_mbx: Mailbox::new(send, mbx_size, dpm::SEND_MBX_BIT),
            recv_mbx: Mailbox::new(recv, mbx_size, dpm::RECV_MBX_BIT),
            host_cos_offset: base + comm_channel::APPLICATION_COS,
            netx_cos_offset: base
                + comm_channel::COMMON_STATUS
                + common_status::COMMUNICATION_COS as u32,
            io_areas,
            info: Some(info),
            state: Mutex::new(FlagState::default()),
            init_lock: Mutex::new(()),
            dma: Mutex::new([None; 2]),
            events: Self::events(os),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_system(&self) -> bool {
        self.kind == ChannelKind::System
    }

    pub(crate) fn notify(&self, notes: &[Notification]) {
        if notes.is_empty() {
            return;
        }
        // Clone the callbacks out so they run without the lock held, and may
        // themselves register or unregister.
        let callbacks: Vec<(NotifyKind, NotifyFn)> = self.callbacks.lock().clone();
        for note in notes {
            for (kind, callback) in callbacks.iter() {
                if *kind == note.kind() {
                    callback(note);
                }
            }
        }
    }
}

/// A channel together with the device that owns it.  All channel operations
/// are performed through this.
pub struct ChannelRef<'a, O: Os> {
    pub(crate) device: &'a Device<O>,
    pub(crate) channel: &'a Channel<O>,
}

impl<O: Os> Clone for ChannelRef<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O: Os> Copy for ChannelRef<'_, O> {}

impl<'a, O: Os> ChannelRef<'a, O> {
    pub(crate) fn new(device: &'a Device<O>, channel: &'a Channel<O>) -> Self {
        Self { device, channel }
    }

    pub(crate) fn transport(&self) -> &'a dyn Transport {
        self.device.transport()
    }

    pub(crate) fn os(&self) -> &'a O {
        self.device.os()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'a, FlagState> {
        self.channel.state.lock()
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind
    }

    pub fn is_system(&self) -> bool {
        self.channel.is_system()
    }

    /// Handshake block id
    pub fn block_id(&self) -> u8 {
        self.channel.block_id
    }

    /// Information block the channel was built from.  `None` for the system
    /// channel.
    pub fn info(&self) -> Option<&'a ChannelInfo> {
        self.channel.info.as_ref()
    }

    /// DPM offset and size of the channel
    pub fn region(&self) -> (u32, u32) {
        (self.channel.base, self.channel.size)
    }

    /// Send and receive mailbox capacities, packet header included
    pub fn mailbox_size(&self) -> (u32, u32) {
        (self.channel.send_mbx.size, self.channel.recv_mbx.size)
    }

    /// Cached host flags
    pub fn host_flags(&self) -> u16 {
        self.lock_state().host_flags
    }

    /// Cached device flags
    pub fn netx_flags(&self) -> u16 {
        self.lock_state().netx_flags
    }

    /// Cached device COS flags, and the bits that changed with the last
    /// update
    pub fn device_cos(&self) -> (u32, u32) {
        let st = self.lock_state();
        (st.device_cos, st.device_cos_changed)
    }

    /// Whether the interrupt split maintains the cached flags.  Otherwise
    /// they are re-read from the DPM on demand.
    pub(crate) fn irq_driven(&self) -> bool {
        self.device.irq_active()
    }

    fn read_netx_word(&self) -> Result<u16> {
        let offset = self.channel.cell + self.channel.width.netx_offset();
        match self.channel.width {
            HandshakeWidth::Bits8 => Ok(self.transport().read_u8(offset)? as u16),
            HandshakeWidth::Bits16 => self.transport().read_u16(offset),
        }
    }

    fn read_host_word(&self) -> Result<u16> {
        let offset = self.channel.cell + self.channel.width.host_offset();
        match self.channel.width {
            HandshakeWidth::Bits8 => Ok(self.transport().read_u8(offset)? as u16),
            HandshakeWidth::Bits16 => self.transport().read_u16(offset),
        }
    }

    pub(crate) fn write_host_word(&self, flags: u16) -> Result<()> {
        let offset = self.channel.cell + self.channel.width.host_offset();
        match self.channel.width {
            HandshakeWidth::Bits8 => self.transport().write_u8(offset, flags as u8),
            HandshakeWidth::Bits16 => self.transport().write_u16(offset, flags),
        }
    }

    /// Read the device COS word into the cache and acknowledge it.  Must be
    /// called with the state lock held, and only while the device's COS
    /// command bit differs from the host's acknowledge bit.
    pub(crate) fn take_device_cos_locked(&self, st: &mut FlagState) -> Result<()> {
        let cos = self.transport().read_u32(self.channel.netx_cos_offset)?;
        st.device_cos_changed = st.device_cos ^ cos;
        st.device_cos = cos;
        trace!(
            "{}: device COS {cos:#010X} changed {:#010X}",
            self.device.name(),
            st.device_cos_changed
        );
        self.toggle_bit_locked(st, bit_mask(dpm::NETX_COS_BIT))
    }

    /// Re-read the device flags (and, for the system channel, the device
    /// sync flags).  A pending device COS command is read and acknowledged.
    pub(crate) fn read_handshake_flags_locked(
        &self,
        st: &mut FlagState,
        read_host: bool,
    ) -> Result<()> {
        if read_host {
            st.host_flags = self.read_host_word()?;
        }
        st.netx_flags = self.read_netx_word()?;
        if self.channel.is_system() {
            self.device.read_sync_flags()?;
        }
        if (st.host_flags ^ st.netx_flags) & bit_mask(dpm::NETX_COS_BIT) != 0 {
            self.take_device_cos_locked(st)?;
        }
        Ok(())
    }

    /// Refresh the cached device flags from the DPM.
    ///
    /// Does nothing while the interrupt split maintains the cache.
    pub fn read_handshake_flags(&self) -> Result<()> {
        if self.irq_driven() {
            return Ok(());
        }
        let mut st = self.lock_state();
        self.read_handshake_flags_locked(&mut st, false)
    }

    /// Re-read both halves of the handshake cell and the device COS word,
    /// discarding the cache
    pub(crate) fn resync(&self) -> Result<()> {
        let mut st = self.lock_state();
        st.host_flags = self.read_host_word()?;
        st.netx_flags = self.read_netx_word()?;
        st.device_cos = self.transport().read_u32(self.channel.netx_cos_offset)?;
        st.device_cos_changed = 0;
        Ok(())
    }

    /// XOR `mask` into the host flags and write them out.  Must be called with
    /// the state lock held.
    pub(crate) fn toggle_bit_locked(&self, st: &mut FlagState, mask: u16) -> Result<()> {
        st.host_flags ^= mask;
        self.write_host_word(st.host_flags)
    }

    /// Toggle the host's copy of the bits in `mask`
    pub fn toggle_bit(&self, mask: u16) -> Result<()> {
        let mut st = self.lock_state();
        self.toggle_bit_locked(&mut st, mask)
    }

    /// Wait until `cond` holds for the cached state.
    ///
    /// Polled operation refreshes the cache from the DPM each time round,
    /// yielding in between.  Interrupt operation waits on the event of `bit`,
    /// which the bottom-half sets whenever that bit changes.
    ///
    /// A `timeout_ms` of 0 checks once.
    pub(crate) fn wait_until(
        &self,
        bit: u8,
        timeout_ms: u32,
        cond: impl Fn(&FlagState) -> bool,
    ) -> Result<bool> {
        let os = self.os();
        let start = os.tick_ms();

        if !self.irq_driven() {
            loop {
                {
                    let mut st = self.lock_state();
                    self.read_handshake_flags_locked(&mut st, false)?;
                    if cond(&*st) {
                        return Ok(true);
                    }
                }
                if os::timed_out(os, start, timeout_ms) {
                    return Ok(false);
                }
                os.sleep_ms(0);
            }
        }

        let event = &self.channel.events[bit as usize % dpm::HANDSHAKE_BITS];
        loop {
            event.reset();
            if cond(&*self.lock_state()) {
                return Ok(true);
            }
            if os::timed_out(os, start, timeout_ms) {
                return Ok(false);
            }
            event.wait(os::remaining_ms(os, start, timeout_ms));
        }
    }

    /// Wait for handshake bit `bit` to reach `state`.
    ///
    /// Returns `Ok(true)` once the state is reached, or `Ok(false)` after
    /// `timeout_ms`.  With a timeout of 0 the state is checked once and
    /// nothing is written.
    pub fn wait_for_bit_state(&self, bit: u8, state: BitState, timeout_ms: u32) -> Result<bool> {
        if bit as usize >= dpm::HANDSHAKE_BITS {
            return Err(Error::InvalidParameter);
        }
        self.wait_until(bit, timeout_ms, |st| st.bit_state(bit, state))
    }

    /// Whether the channel is ready.  For the system channel this is the
    /// device's ready flag, for a communication channel the ready COS flag.
    pub fn is_ready(&self) -> Result<bool> {
        self.read_handshake_flags()?;
        let st = self.lock_state();
        Ok(match self.channel.kind {
            ChannelKind::System => st.netx_flags & NetxSysFlags::READY.bits() != 0,
            ChannelKind::Communication(_) => st.device_cos & CommCos::READY.bits() != 0,
        })
    }

    /// Whether the protocol stack is configured and running
    pub fn is_running(&self) -> Result<bool> {
        self.read_handshake_flags()?;
        Ok(self.lock_state().device_cos & CommCos::RUN.bits() != 0)
    }

    /// Whether the device reports active bus communication
    pub fn is_communicating(&self) -> Result<bool> {
        if self.channel.is_system() {
            return Ok(false);
        }
        self.read_handshake_flags()?;
        Ok(self.lock_state().netx_flags & bit_mask(dpm::READY_BIT) != 0)
    }

    /// Read the channel's common status block
    pub fn common_status(&self) -> Result<CommonStatus> {
        if self.channel.is_system() {
            return Err(Error::InvalidCommand);
        }
        let mut buf = [0u8; common_status::SIZE];
        self.transport()
            .read(self.channel.base + comm_channel::COMMON_STATUS, &mut buf)?;
        CommonStatus::decode(&buf)
    }

    /// Copy the device's host watchdog value into the device watchdog word,
    /// telling the device the host is alive.  Returns the value written.
    pub fn trigger_watchdog(&self) -> Result<u32> {
        if self.channel.is_system() {
            return Err(Error::InvalidCommand);
        }
        let status = self.channel.base + comm_channel::COMMON_STATUS;
        let value = self
            .transport()
            .read_u32(status + common_status::HOST_WATCHDOG as u32)?;
        self.transport()
            .write_u32(self.channel.base + comm_channel::DEVICE_WATCHDOG, value)?;
        Ok(value)
    }

    /// Register `callback` for notifications of `kind`, replacing any
    /// existing one
    pub fn register_notification<F>(&self, kind: NotifyKind, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut callbacks = self.channel.callbacks.lock();
        callbacks.retain(|(k, _)| *k != kind);
        callbacks.push((kind, Arc::new(callback)));
    }

    pub fn unregister_notification(&self, kind: NotifyKind) {
        self.channel.callbacks.lock().retain(|(k, _)| *k != kind);
    }

    /// Packets passed through the send and receive mailboxes since attach
    pub fn packet_counts(&self) -> (u32, u32) {
        (
            self.channel.send_mbx.packets.load(Ordering::Relaxed),
            self.channel.recv_mbx.packets.load(Ordering::Relaxed),
        )
    }
}

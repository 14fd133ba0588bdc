//! Test support: a heap-backed DPM and device-side helpers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::dpm::{
    self, HandshakeWidth, channel_info, common_status, comm_channel, handshake_cell_offset,
    system_info,
};
use crate::transport::{MemoryMapped, Transport};
use crate::Result;

/// Size of the simulated firmware DPM
pub const SIM_DPM_SIZE: u32 = 0x2000;
/// Size of the simulated communication channel
pub const SIM_COMM_SIZE: u32 = 0x1000;
/// Capacity of the simulated communication channel's mailboxes
pub const SIM_MAILBOX_SIZE: u16 = 0x100;
/// Block id of the simulated communication channel
pub const SIM_COMM_BLOCK: u8 = 2;

/// Zeroed, word-aligned memory standing in for a DPM.
///
/// Both the engine (through [`SimDpm::mmio()`]) and tests acting as the device
/// access it through raw pointers only.
pub struct SimDpm {
    base: NonNull<u32>,
    words: usize,
}

unsafe impl Send for SimDpm {}
unsafe impl Sync for SimDpm {}

impl Drop for SimDpm {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl SimDpm {
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(4);
        let memory: Box<[u32]> = alloc::vec![0u32; words].into_boxed_slice();
        let raw = Box::into_raw(memory) as *mut u32;
        Self {
            base: NonNull::new(raw).unwrap(),
            words,
        }
    }

    /// A DPM as left by a running firmware with one communication channel
    /// (block id 2, 16-bit handshake, ready and running).
    pub fn firmware() -> Self {
        let sim = Self::new(SIM_DPM_SIZE as usize);
        let m = sim.mmio();
        m.write(system_info::OFFSET, &dpm::COOKIE_FIRMWARE).unwrap();
        m.write_u32(system_info::OFFSET + system_info::DPM_TOTAL_SIZE as u32, SIM_DPM_SIZE)
            .unwrap();
        m.write_u32(system_info::OFFSET + system_info::SERIAL_NUMBER as u32, 20_123)
            .unwrap();

        let info = |index: u32, bytes: [u8; 4], size: u32, mailbox: u16| {
            let at = channel_info::OFFSET + index * channel_info::SIZE as u32;
            m.write(at, &bytes).unwrap();
            m.write_u32(at + channel_info::CHANNEL_SIZE as u32, size).unwrap();
            m.write_u16(at + channel_info::MAILBOX_SIZE as u32, mailbox)
                .unwrap();
        };
        info(0, [3, 0, 0x10, 0], dpm::SYSTEM_CHANNEL_SIZE, 0);
        info(1, [4, 0, 0x10, 0], dpm::HANDSHAKE_CHANNEL_SIZE, 0);
        info(2, [5, 0, 0x20, 8], SIM_COMM_SIZE, SIM_MAILBOX_SIZE);

        sim.set_netx(0, dpm::NetxSysFlags::READY.bits());
        sim.set_comm_cos(dpm::CommCos::READY | dpm::CommCos::RUN);
        sim
    }

    pub fn mmio(&self) -> MemoryMapped {
        unsafe { MemoryMapped::new(self.base.cast::<u8>(), self.words * 4) }
    }

    fn width(block: u8) -> HandshakeWidth {
        if block == dpm::SYSTEM_BLOCK_ID {
            HandshakeWidth::Bits8
        } else {
            HandshakeWidth::Bits16
        }
    }

    /// Device flags of a block's handshake cell
    pub fn netx(&self, block: u8) -> u16 {
        let at = handshake_cell_offset(block);
        match Self::width(block) {
            HandshakeWidth::Bits8 => self.mmio().read_u8(at + 2).unwrap() as u16,
            HandshakeWidth::Bits16 => self.mmio().read_u16(at).unwrap(),
        }
    }

    /// Host flags of a block's handshake cell
    pub fn host(&self, block: u8) -> u16 {
        let at = handshake_cell_offset(block);
        match Self::width(block) {
            HandshakeWidth::Bits8 => self.mmio().read_u8(at + 3).unwrap() as u16,
            HandshakeWidth::Bits16 => self.mmio().read_u16(at + 2).unwrap(),
        }
    }

    pub fn set_netx(&self, block: u8, flags: u16) {
        let at = handshake_cell_offset(block);
        match Self::width(block) {
            HandshakeWidth::Bits8 => self.mmio().write_u8(at + 2, flags as u8).unwrap(),
            HandshakeWidth::Bits16 => self.mmio().write_u16(at, flags).unwrap(),
        }
    }

    pub fn toggle_netx(&self, block: u8, mask: u16) {
        self.set_netx(block, self.netx(block) ^ mask);
    }

    /// Make the device's copy of `mask` match the host's, as the device does
    /// when acknowledging a host command.
    pub fn ack(&self, block: u8, mask: u16) {
        let host = self.host(block);
        let netx = self.netx(block);
        self.set_netx(block, (netx & !mask) | (host & mask));
    }

    /// Whether the host holds a command on `mask` the device has not
    /// acknowledged
    pub fn pending(&self, block: u8, mask: u16) -> bool {
        (self.host(block) ^ self.netx(block)) & mask != 0
    }

    pub fn comm_base(&self) -> u32 {
        dpm::FIRST_COMM_CHANNEL_OFFSET
    }

    pub fn comm_cos(&self) -> dpm::CommCos {
        let at = self.comm_base() + comm_channel::COMMON_STATUS;
        dpm::CommCos::from_bits_retain(self.mmio().read_u32(at).unwrap())
    }

    pub fn set_comm_cos(&self, cos: dpm::CommCos) {
        let at = self.comm_base()
            + comm_channel::COMMON_STATUS
            + common_status::COMMUNICATION_COS as u32;
        self.mmio().write_u32(at, cos.bits()).unwrap();
    }

    pub fn app_cos(&self) -> dpm::AppCos {
        let at = self.comm_base() + comm_channel::APPLICATION_COS;
        dpm::AppCos::from_bits_retain(self.mmio().read_u32(at).unwrap())
    }

    /// Place a packet in the communication channel's receive mailbox and flag
    /// it to the host
    pub fn deliver(&self, frame: &[u8]) {
        let recv = self.comm_base() + comm_channel::SEND_MAILBOX + 4 + SIM_MAILBOX_SIZE as u32;
        self.mmio().write(recv + dpm::mailbox::DATA, frame).unwrap();
        self.mmio().write_u16(recv, 1).unwrap();
        self.toggle_netx(SIM_COMM_BLOCK, dpm::bit_mask(dpm::RECV_MBX_BIT));
    }

    /// Read back what the host put into the communication channel's send
    /// mailbox
    pub fn sent(&self, len: usize) -> Vec<u8> {
        let send = self.comm_base() + comm_channel::SEND_MAILBOX;
        let mut buf = alloc::vec![0u8; len];
        self.mmio().read(send + dpm::mailbox::DATA, &mut buf).unwrap();
        buf
    }
}

/// Transport wrapper that counts writes and can stall accesses to a region
#[derive(Clone)]
pub struct CountingTransport {
    inner: MemoryMapped,
    writes: Arc<AtomicUsize>,
    log: Arc<spin::Mutex<Vec<(u32, usize)>>>,
    slow: Arc<spin::Mutex<Option<(u32, u32, u64)>>>,
}

impl CountingTransport {
    pub fn new(inner: MemoryMapped) -> Self {
        Self {
            inner,
            writes: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(spin::Mutex::new(Vec::new())),
            slow: Arc::new(spin::Mutex::new(None)),
        }
    }

    /// Delay every access touching `[start, start + len)` by `ms`
    pub fn slow_within(&self, start: u32, len: u32, ms: u64) {
        *self.slow.lock() = Some((start, len, ms));
    }

    fn stall(&self, offset: u32, len: usize) {
        let slow = *self.slow.lock();
        if let Some((start, n, ms)) = slow {
            if offset < start + n && offset + len as u32 > start {
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether any write since the last [`Self::clear()`] touched
    /// `[start, start + len)`
    pub fn wrote_within(&self, start: u32, len: u32) -> bool {
        self.log
            .lock()
            .iter()
            .any(|&(at, n)| at < start + len && at + n as u32 > start)
    }

    pub fn clear(&self) {
        self.writes.store(0, Ordering::SeqCst);
        self.log.lock().clear();
    }
}

impl Transport for CountingTransport {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.stall(offset, buf.len());
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.stall(offset, data.len());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((offset, data.len()));
        self.inner.write(offset, data)
    }

    fn read_u16(&self, offset: u32) -> Result<u16> {
        self.stall(offset, 2);
        self.inner.read_u16(offset)
    }

    fn read_u32(&self, offset: u32) -> Result<u32> {
        self.stall(offset, 4);
        self.inner.read_u32(offset)
    }

    fn write_u16(&self, offset: u32, value: u16) -> Result<()> {
        self.stall(offset, 2);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((offset, 2));
        self.inner.write_u16(offset, value)
    }

    fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.stall(offset, 4);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((offset, 4));
        self.inner.write_u32(offset, value)
    }
}

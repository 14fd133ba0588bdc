//! The device instance.
//!
//! A [`Device`] owns the transport, the OS binding, the configuration and the
//! channel arena.  It is created by [`Device::attach()`], which validates the
//! DPM content and lays out the channels from the channel information blocks.
//! Index 0 of the arena is always the system channel; communication channels
//! follow in the order their information blocks list them.
//!
//! Besides the channels, the device holds the device-wide state: the sync
//! flags (handshake cell 1), the interrupt snapshot exchange, the reset-active
//! flag and, on boards with a shared interrupt line, the location of the
//! global register block used for interrupt gating and DMA setup.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::channel::{BitState, Channel, ChannelRef};
use crate::config::{DeviceConfig, IrqMode};
use crate::dpm::{
    self, ChannelInfo, ChannelType, ExceptionInfo, SystemInfo, bit_mask, channel_info,
    global_regs, handshake_cell_offset, system_info, system_status,
};
use crate::irq::IrqExchange;
use crate::os::{self, Event, Os};
use crate::transport::Transport;
use crate::{Error, Result};

/// Sync notification callback.  Receives the device sync flags and the bits
/// that changed.
pub type SyncFn = Arc<dyn Fn(u16, u16) + Send + Sync>;

/// Direction of a DMA buffer, from the host's point of view
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device writes, host reads
    Input = 0,
    /// Host writes, device reads
    Output = 1,
}

/// A host buffer the device may access by DMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    /// Bus address of the buffer
    pub phys_addr: u64,
    pub size: u32,
    pub direction: DmaDirection,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SyncState {
    host: u16,
    netx: u16,
}

/// An attached device
pub struct Device<O: Os> {
    config: DeviceConfig,
    transport: Box<dyn Transport>,
    os: O,
    system_info: Mutex<SystemInfo>,
    channels: Vec<Channel<O>>,
    pub(crate) irq: IrqExchange,
    reset_active: AtomicBool,
    irq_enabled: AtomicBool,
    sync: Mutex<SyncState>,
    sync_event: O::Event,
    sync_callback: Mutex<Option<SyncFn>>,
    global_regs: Option<u32>,
}

impl<O: Os> Device<O> {
    /// Attach to the device behind `transport`.
    ///
    /// The DPM must carry the bootloader or the firmware cookie.  Interrupts
    /// start disabled; see [`Self::enable_irq()`].
    pub fn attach<T: Transport + 'static>(transport: T, os: O, config: DeviceConfig) -> Result<Self> {
        let transport: Box<dyn Transport> = Box::new(transport);

        let system_info = read_system_info(transport.as_ref())?;
        if !system_info.is_bootloader() && !system_info.is_firmware() {
            error!(
                "{}: invalid DPM content, cookie {:02X?}",
                config.name, system_info.cookie
            );
            return Err(Error::InvalidContent);
        }

        let global_regs = if config.shared_irq_line {
            match system_info.dpm_total_size.checked_sub(global_regs::SIZE) {
                Some(regs) if regs >= dpm::FIRST_COMM_CHANNEL_OFFSET => Some(regs),
                _ => {
                    error!(
                        "{}: DPM size {:#X} too small for global registers",
                        config.name, system_info.dpm_total_size
                    );
                    return Err(Error::InvalidContent);
                }
            }
        } else {
            None
        };

        let mut channels = Vec::new();
        channels.push(Channel::system(&os));

        let mut base = dpm::FIRST_COMM_CHANNEL_OFFSET;
        let mut number = 0u8;
        for index in 0..channel_info::COUNT {
            let mut buf = [0u8; channel_info::SIZE];
            let offset = channel_info::OFFSET + (index * channel_info::SIZE) as u32;
            transport.read(offset, &mut buf)?;
            let info = ChannelInfo::decode(&buf)?;
            if info.channel_type != ChannelType::Communication {
                continue;
            }
            if base + info.channel_size > system_info.dpm_total_size {
                error!(
                    "{}: channel {number} at {base:#X} exceeds DPM size",
                    config.name
                );
                return Err(Error::InvalidContent);
            }
            let channel =
                Channel::communication(&os, transport.as_ref(), number, index as u8, base, info)?;
            debug!(
                "{}: channel {number} block {index} at {base:#X} size {:#X} mailbox {:#X}",
                config.name, info.channel_size, info.mailbox_size
            );
            channels.push(channel);
            base += info.channel_size;
            number += 1;
        }

        info!(
            "{}: attached, {} cookie {:02X?}, serial {}, {number} channel(s)",
            config.name,
            if system_info.is_bootloader() {
                "bootloader"
            } else {
                "firmware"
            },
            system_info.cookie,
            system_info.serial_number
        );

        let sync_event = os.create_event();
        let device = Self {
            config,
            transport,
            os,
            system_info: Mutex::new(system_info),
            channels,
            irq: IrqExchange::new(),
            reset_active: AtomicBool::new(false),
            irq_enabled: AtomicBool::new(false),
            sync: Mutex::new(SyncState::default()),
            sync_event,
            sync_callback: Mutex::new(None),
            global_regs,
        };
        device.resync()?;
        Ok(device)
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn os(&self) -> &O {
        &self.os
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Location of the global register block, on boards with a shared
    /// interrupt line
    pub fn global_regs(&self) -> Option<u32> {
        self.global_regs
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }

    /// Whether cached state is maintained by the interrupt bottom-half
    pub(crate) fn irq_active(&self) -> bool {
        self.config.irq_mode == IrqMode::Interrupt && self.irq_enabled()
    }

    /// Whether a reset is in progress
    pub fn reset_active(&self) -> bool {
        self.reset_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_reset_active(&self, active: bool) {
        self.reset_active.store(active, Ordering::Release);
    }

    /// The device's init mutex, serializing resets, channel inits and the
    /// periodic COS sweep
    pub(crate) fn init_lock(&self) -> &Mutex<()> {
        &self.channels[0].init_lock
    }

    /// Communication channel `number`
    pub fn channel(&self, number: usize) -> Result<ChannelRef<'_, O>> {
        self.channels
            .get(number + 1)
            .map(|ch| ChannelRef::new(self, ch))
            .ok_or(Error::InvalidChannel)
    }

    pub fn system_channel(&self) -> ChannelRef<'_, O> {
        ChannelRef::new(self, &self.channels[0])
    }

    /// Number of communication channels
    pub fn channel_count(&self) -> usize {
        self.channels.len() - 1
    }

    /// Every channel, the system channel first
    pub fn channels(&self) -> impl Iterator<Item = ChannelRef<'_, O>> {
        self.channels.iter().map(move |ch| ChannelRef::new(self, ch))
    }

    /// System information as read at attach or after the last reset
    pub fn system_info(&self) -> SystemInfo {
        *self.system_info.lock()
    }

    /// Re-read the system information block
    pub fn read_system_info(&self) -> Result<SystemInfo> {
        let info = read_system_info(self.transport())?;
        *self.system_info.lock() = info;
        Ok(info)
    }

    /// Read the exception information left by the device's CPU
    pub fn exception_info(&self) -> Result<ExceptionInfo> {
        let mut words = [0u32; system_status::EXCEPTION_INFO_WORDS];
        for (ii, word) in words.iter_mut().enumerate() {
            *word = self
                .transport()
                .read_u32(system_status::EXCEPTION_INFO + ii as u32 * 4)?;
        }
        Ok(ExceptionInfo::decode(&words))
    }

    /// Enable interrupt operation.
    ///
    /// The cached flags are re-read first, after which they are maintained by
    /// [`Self::dsr()`].  On boards with a shared interrupt line the handshake
    /// interrupt sources are enabled in the global registers.
    pub fn enable_irq(&self) -> Result<()> {
        if self.config.irq_mode != IrqMode::Interrupt {
            return Err(Error::InvalidCommand);
        }
        if let Some(regs) = self.global_regs {
            self.transport().write_u32(
                regs + global_regs::IRQ_ENABLE,
                global_regs::IRQ_GLOBAL_ENABLE | global_regs::IRQ_HANDSHAKE_MASK,
            )?;
        }
        self.irq_enabled.store(true, Ordering::Release);
        debug!("{}: interrupts enabled", self.name());
        self.resync()
    }

    /// Return to polled operation
    pub fn disable_irq(&self) -> Result<()> {
        if let Some(regs) = self.global_regs {
            self.transport().write_u32(regs + global_regs::IRQ_ENABLE, 0)?;
        }
        self.irq_enabled.store(false, Ordering::Release);
        self.irq.invalidate();
        debug!("{}: interrupts disabled", self.name());
        Ok(())
    }

    fn sync_cell(&self) -> u32 {
        handshake_cell_offset(dpm::SYNC_BLOCK_ID)
    }

    /// Re-read the device sync flags
    pub(crate) fn read_sync_flags(&self) -> Result<()> {
        let netx = self.transport().read_u16(self.sync_cell())?;
        self.sync.lock().netx = netx;
        Ok(())
    }

    /// Apply the sync cell of an interrupt snapshot
    pub(crate) fn process_sync(&self, cell: u32) {
        let netx = cell as u16;
        let changed = {
            let mut sync = self.sync.lock();
            let changed = sync.netx ^ netx;
            sync.netx = netx;
            changed
        };
        if changed == 0 {
            return;
        }
        trace!("{}: sync {netx:#06X} changed {changed:#06X}", self.name());
        self.sync_event.set();
        let callback = self.sync_callback.lock().clone();
        if let Some(callback) = callback {
            callback(netx, changed);
        }
    }

    pub(crate) fn clear_sync_state(&self) {
        *self.sync.lock() = SyncState::default();
    }

    /// Cached host and device sync flags
    pub fn sync_flags(&self) -> (u16, u16) {
        let sync = self.sync.lock();
        (sync.host, sync.netx)
    }

    /// Toggle the host's copy of sync bit `bit`
    pub fn toggle_sync_bit(&self, bit: u8) -> Result<()> {
        if bit as usize >= dpm::HANDSHAKE_BITS {
            return Err(Error::InvalidParameter);
        }
        let mut sync = self.sync.lock();
        sync.host ^= bit_mask(bit);
        self.transport().write_u16(self.sync_cell() + 2, sync.host)
    }

    /// Wait for sync bit `bit` to reach `state`.  Returns `Ok(false)` on
    /// timeout.
    pub fn wait_sync_state(&self, bit: u8, state: BitState, timeout_ms: u32) -> Result<bool> {
        if bit as usize >= dpm::HANDSHAKE_BITS {
            return Err(Error::InvalidParameter);
        }
        let mask = bit_mask(bit);
        let reached = |sync: &SyncState| match state {
            BitState::Clear => sync.netx & mask == 0,
            BitState::Set => sync.netx & mask != 0,
            BitState::Equal => (sync.host ^ sync.netx) & mask == 0,
            BitState::NotEqual => (sync.host ^ sync.netx) & mask != 0,
        };

        let os = self.os();
        let start = os.tick_ms();
        loop {
            let irq = self.irq_active();
            if irq {
                self.sync_event.reset();
            } else {
                self.read_sync_flags()?;
            }
            if reached(&*self.sync.lock()) {
                return Ok(true);
            }
            if os::timed_out(os, start, timeout_ms) {
                return Ok(false);
            }
            if irq {
                self.sync_event.wait(os::remaining_ms(os, start, timeout_ms));
            } else {
                os.sleep_ms(0);
            }
        }
    }

    /// Register `callback` for changes of the device sync flags, replacing
    /// any existing one.  Called from the interrupt bottom-half.
    pub fn register_sync_notification<F>(&self, callback: F)
    where
        F: Fn(u16, u16) + Send + Sync + 'static,
    {
        *self.sync_callback.lock() = Some(Arc::new(callback));
    }

    pub fn unregister_sync_notification(&self) {
        *self.sync_callback.lock() = None;
    }

    /// Program DMA buffers for communication channel `channel`.
    ///
    /// Each channel owns two hardware DMA channels, one per direction.
    /// Requires the global register block.
    pub fn configure_dma(&self, channel: usize, buffers: &[DmaBuffer]) -> Result<()> {
        let Some(regs) = self.global_regs else {
            return Err(Error::InvalidCommand);
        };
        let ch = self.channel(channel)?;
        for buffer in buffers {
            if buffer.size == 0 {
                return Err(Error::InvalidParameter);
            }
            let index = channel * 2 + buffer.direction as usize;
            if index >= global_regs::DMA_CHANNEL_COUNT {
                return Err(Error::InvalidChannel);
            }
            let at = regs + global_regs::DMA_CHANNELS + index as u32 * global_regs::DMA_CHANNEL_SIZE;
            let mut control = global_regs::DMA_CONTROL_ENABLE;
            if buffer.direction == DmaDirection::Output {
                control |= global_regs::DMA_CONTROL_HOST_TO_DEVICE;
            }
            let transport = self.transport();
            transport.write_u32(at + global_regs::DMA_BASE_LOW, buffer.phys_addr as u32)?;
            transport.write_u32(at + global_regs::DMA_BASE_HIGH, (buffer.phys_addr >> 32) as u32)?;
            transport.write_u32(at + global_regs::DMA_BUFFER_SIZE, buffer.size)?;
            transport.write_u32(at + global_regs::DMA_CONTROL, control)?;
            ch.channel.dma.lock()[buffer.direction as usize] = Some(*buffer);
            debug!(
                "{}: DMA channel {index} {:?} at {:#X} size {:#X}",
                self.name(),
                buffer.direction,
                buffer.phys_addr,
                buffer.size
            );
        }
        Ok(())
    }

    /// DMA buffers configured for communication channel `channel`, input then
    /// output
    pub fn dma_buffers(&self, channel: usize) -> Result<[Option<DmaBuffer>; 2]> {
        Ok(*self.channel(channel)?.channel.dma.lock())
    }
}

fn read_system_info(transport: &dyn Transport) -> Result<SystemInfo> {
    let mut buf = [0u8; system_info::SIZE];
    transport.read(system_info::OFFSET, &mut buf)?;
    SystemInfo::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::dpm::HandshakeWidth;
    use crate::os::StdOs;
    use crate::testutil::{SIM_COMM_BLOCK, SIM_COMM_SIZE, SIM_DPM_SIZE, SIM_MAILBOX_SIZE, SimDpm};

    fn attach(sim: &SimDpm, config: DeviceConfig) -> Result<Device<StdOs>> {
        Device::attach(sim.mmio(), StdOs::new(), config)
    }

    #[test]
    fn test_attach_lays_out_channels() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::new("test")).unwrap();
        assert_eq!(device.name(), "test");
        assert_eq!(device.channel_count(), 1);
        assert!(device.system_info().is_firmware());
        assert_eq!(device.system_info().serial_number, 20_123);

        let ch = device.channel(0).unwrap();
        assert_eq!(ch.kind(), ChannelKind::Communication(0));
        assert_eq!(ch.block_id(), SIM_COMM_BLOCK);
        assert_eq!(ch.region(), (dpm::FIRST_COMM_CHANNEL_OFFSET, SIM_COMM_SIZE));
        assert_eq!(
            ch.mailbox_size(),
            (SIM_MAILBOX_SIZE as u32, SIM_MAILBOX_SIZE as u32)
        );
        assert_eq!(ch.info().unwrap().handshake_width, HandshakeWidth::Bits16);

        let kinds: Vec<ChannelKind> = device.channels().map(|ch| ch.kind()).collect();
        assert_eq!(
            kinds,
            [ChannelKind::System, ChannelKind::Communication(0)]
        );
        assert_eq!(device.channel(1).err(), Some(Error::InvalidChannel));
        assert!(device.global_regs().is_none());
    }

    #[test]
    fn test_attach_rejects_invalid_content() {
        let sim = SimDpm::firmware();
        sim.mmio().write_u32(0, dpm::INVALID_CONTENT).unwrap();
        assert_eq!(
            attach(&sim, DeviceConfig::default()).err(),
            Some(Error::InvalidContent)
        );
        sim.mmio().write(0, b"abcd").unwrap();
        assert_eq!(
            attach(&sim, DeviceConfig::default()).err(),
            Some(Error::InvalidContent)
        );
    }

    #[test]
    fn test_attach_bootloader_without_channels() {
        let sim = SimDpm::firmware();
        sim.mmio().write(0, &dpm::COOKIE_BOOTLOADER).unwrap();
        let at = channel_info::OFFSET + 2 * channel_info::SIZE as u32;
        sim.mmio().write_u8(at, ChannelType::NotAvailable as u8).unwrap();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        assert!(device.system_info().is_bootloader());
        assert_eq!(device.channel_count(), 0);
        assert_eq!(device.channel(0).err(), Some(Error::InvalidChannel));
    }

    #[test]
    fn test_attach_reads_existing_flags() {
        let sim = SimDpm::firmware();
        sim.set_netx(SIM_COMM_BLOCK, bit_mask(dpm::PD0_IN_BIT));
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        let ch = device.channel(0).unwrap();
        assert_eq!(ch.netx_flags(), bit_mask(dpm::PD0_IN_BIT));
        assert_eq!(
            ch.device_cos().0,
            (dpm::CommCos::READY | dpm::CommCos::RUN).bits()
        );
    }

    #[test]
    fn test_global_regs_at_end_of_dpm() {
        let sim = SimDpm::firmware();
        let config = DeviceConfig::default().with_shared_irq_line(true);
        let device = attach(&sim, config).unwrap();
        assert_eq!(device.global_regs(), Some(SIM_DPM_SIZE - global_regs::SIZE));
    }

    #[test]
    fn test_enable_irq_requires_interrupt_mode() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        assert_eq!(device.enable_irq(), Err(Error::InvalidCommand));
        assert!(!device.irq_enabled());

        let config = DeviceConfig::default().with_irq_mode(IrqMode::Interrupt);
        let device = attach(&sim, config).unwrap();
        device.enable_irq().unwrap();
        assert!(device.irq_active());
        device.disable_irq().unwrap();
        assert!(!device.irq_active());
    }

    #[test]
    fn test_sync_bits() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        let cell = handshake_cell_offset(dpm::SYNC_BLOCK_ID);

        device.toggle_sync_bit(4).unwrap();
        assert_eq!(sim.mmio().read_u16(cell + 2).unwrap(), 0x0010);
        assert_eq!(device.wait_sync_state(4, BitState::NotEqual, 0), Ok(true));

        // Device acknowledges
        sim.mmio().write_u16(cell, 0x0010).unwrap();
        assert_eq!(device.wait_sync_state(4, BitState::Equal, 100), Ok(true));
        assert_eq!(device.wait_sync_state(4, BitState::Set, 0), Ok(true));
        assert_eq!(device.sync_flags(), (0x0010, 0x0010));

        assert_eq!(device.toggle_sync_bit(16), Err(Error::InvalidParameter));
        assert_eq!(
            device.wait_sync_state(16, BitState::Set, 0),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_sync_notification_from_snapshot() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::<(u16, u16)>::new()));
        let record = seen.clone();
        device.register_sync_notification(move |netx, changed| {
            record.lock().push((netx, changed));
        });

        device.process_sync(0x0003);
        device.process_sync(0x0003);
        device.process_sync(0x0001);
        assert_eq!(*seen.lock(), [(0x0003u16, 0x0003u16), (0x0001, 0x0002)]);

        device.unregister_sync_notification();
        device.process_sync(0);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_configure_dma() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        let input = DmaBuffer {
            phys_addr: 0x1_2345_6000,
            size: 0x800,
            direction: DmaDirection::Input,
        };
        let output = DmaBuffer {
            direction: DmaDirection::Output,
            ..input
        };
        assert_eq!(
            device.configure_dma(0, &[input]),
            Err(Error::InvalidCommand)
        );

        let config = DeviceConfig::default().with_shared_irq_line(true);
        let device = attach(&sim, config).unwrap();
        device.configure_dma(0, &[input, output]).unwrap();

        let regs = device.global_regs().unwrap() + global_regs::DMA_CHANNELS;
        let mmio = sim.mmio();
        let read = |index: u32, reg: u32| {
            mmio.read_u32(regs + index * global_regs::DMA_CHANNEL_SIZE + reg)
                .unwrap()
        };
        assert_eq!(read(0, global_regs::DMA_BASE_LOW), 0x2345_6000);
        assert_eq!(read(0, global_regs::DMA_BASE_HIGH), 1);
        assert_eq!(read(0, global_regs::DMA_BUFFER_SIZE), 0x800);
        assert_eq!(read(0, global_regs::DMA_CONTROL), 1);
        assert_eq!(read(1, global_regs::DMA_CONTROL), 3);
        assert_eq!(device.dma_buffers(0), Ok([Some(input), Some(output)]));

        assert_eq!(
            device.configure_dma(1, &[input]),
            Err(Error::InvalidChannel)
        );
        let empty = DmaBuffer { size: 0, ..input };
        assert_eq!(
            device.configure_dma(0, &[empty]),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_exception_info() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, DeviceConfig::default()).unwrap();
        assert_eq!(device.exception_info(), Ok(ExceptionInfo::None));

        let at = system_status::EXCEPTION_INFO;
        sim.mmio().write_u32(at, 2).unwrap();
        sim.mmio().write_u32(at + 8, 0x0800_0100).unwrap();
        match device.exception_info().unwrap() {
            ExceptionInfo::CortexM { pc, .. } => assert_eq!(pc, 0x0800_0100),
            other => panic!("unexpected {other:?}"),
        }
    }
}

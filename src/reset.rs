//! Device reset and channel init.
//!
//! A reset runs in three phases, all under the device's init mutex:
//!
//! 1. Prepare: mark the reset active, so the interrupt bottom-half ignores
//!    whatever the device does meanwhile, and zero every channel's cached
//!    flags.
//! 2. Execute: write the reset mode and the reset cookie, raise the host reset
//!    flag, and wait for the device to drop its ready flag.  If an application
//!    CPU owns the device's reset line, it performs the actual reset and this
//!    phase does not wait.
//! 3. Finish: wait for the device to become ready again, check its cookie
//!    matches the requested mode, and re-synchronize the cached flags.  For a
//!    device reset by an application CPU the drop of the ready flag is awaited
//!    here instead, within the same timeout.
//!
//! An update start goes through a second not-ready/ready cycle, in which the
//! firmware applies the update.
//!
//! Channel init restarts a single communication channel's protocol stack
//! through the COS protocol, without resetting the device.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{ChannelRef, FlagState};
use crate::config::DeviceClass;
use crate::device::Device;
use crate::dpm::{
    self, AppCos, CommCos, HostSysFlags, NetxSysFlags, ResetMode, system_control,
};
use crate::os::{self, Os, lock_timeout};
use crate::{Error, Result};

/// Interval between polls of the device's ready flag
const RESET_POLL_MS: u32 = 1;

impl<O: Os> Device<O> {
    /// Reset the device.
    ///
    /// `param` is passed to the device in the upper bits of the system
    /// control word.  `timeout_ms` bounds the wait for the device to become
    /// ready again; 0 selects the configured start (or update) timeout.
    pub fn reset(&self, mode: ResetMode, param: u8, timeout_ms: u32) -> Result<()> {
        let _init = lock_timeout(
            self.os(),
            self.init_lock(),
            self.config().init_mutex_timeout_ms,
        )?;

        info!("{}: {mode:?}", self.name());
        self.prepare_reset();
        let result = self
            .execute_reset(mode, param)
            .and_then(|()| self.finish_reset(mode, timeout_ms));
        self.set_reset_active(false);

        match result {
            Ok(()) => {
                self.resync()?;
                debug!("{}: {mode:?} complete", self.name());
                Ok(())
            }
            Err(e) => {
                warn!("{}: {mode:?} failed: {e}", self.name());
                Err(e)
            }
        }
    }

    /// Mark the reset active and zero every channel's cached flags
    pub(crate) fn prepare_reset(&self) {
        self.set_reset_active(true);
        self.irq.invalidate();
        for ch in self.channels() {
            *ch.lock_state() = FlagState::default();
        }
        self.clear_sync_state();
    }

    fn execute_reset(&self, mode: ResetMode, param: u8) -> Result<()> {
        let transport = self.transport();
        let control = (mode as u32 & dpm::RESET_MODE_MASK)
            | (((param as u32) << dpm::RESET_PARAM_SHIFT) & dpm::RESET_PARAM_MASK);
        transport.write_u32(system_control::SYSTEM_CONTROL, control)?;
        transport.write_u32(system_control::COMMAND_COS, dpm::RESET_COOKIE)?;

        let sys = self.system_channel();
        {
            let mut st = sys.lock_state();
            let mut flags = HostSysFlags::RESET;
            if mode == ResetMode::BootStart {
                flags |= HostSysFlags::BOOTSTART;
            }
            st.host_flags |= flags.bits();
            sys.write_host_word(st.host_flags)?;
        }

        if self.config().device_class == DeviceClass::AppCpuManaged {
            debug!("{}: reset handed to application CPU", self.name());
            return Ok(());
        }

        if !self.poll_system_ready(false, self.config().reset_timeout_ms)? {
            error!("{}: device did not leave ready state", self.name());
            return Err(Error::ResetTimeout);
        }
        Ok(())
    }

    fn finish_reset(&self, mode: ResetMode, timeout_ms: u32) -> Result<()> {
        let config = self.config();
        let timeout_ms = match (timeout_ms, mode) {
            (0, ResetMode::UpdateStart) => config.update_timeout_ms,
            (0, _) => config.start_timeout_ms,
            (timeout, _) => timeout,
        };

        let os = self.os();
        let start = os.tick_ms();
        if config.device_class == DeviceClass::AppCpuManaged
            && !self.poll_system_ready(false, timeout_ms)?
        {
            error!("{}: application CPU did not reset the device", self.name());
            return Err(Error::ResetTimeout);
        }

        let left = (timeout_ms as u64).saturating_sub(os::elapsed_ms(os, start)) as u32;
        if !self.poll_system_ready(true, left)? {
            error!("{}: device did not become ready", self.name());
            return Err(Error::ResetTimeout);
        }

        if mode == ResetMode::UpdateStart {
            debug!("{}: waiting for update to be applied", self.name());
            if !self.poll_system_ready(false, config.update_timeout_ms)?
                || !self.poll_system_ready(true, config.update_timeout_ms)?
            {
                error!("{}: update start did not complete", self.name());
                return Err(Error::ResetTimeout);
            }
        }

        let info = self.read_system_info()?;
        let expected = match mode {
            ResetMode::BootStart => info.is_bootloader(),
            ResetMode::ColdStart | ResetMode::UpdateStart => {
                info.is_firmware() || info.is_bootloader()
            }
        };
        if !expected {
            error!(
                "{}: unexpected cookie {:02X?} after {mode:?}",
                self.name(),
                info.cookie
            );
            return Err(Error::FunctionFailed);
        }
        Ok(())
    }

    /// Poll the system channel's device flags until the ready flag is `ready`.
    /// Reads the DPM directly, as the cached flags are not maintained during
    /// a reset.
    fn poll_system_ready(&self, ready: bool, timeout_ms: u32) -> Result<bool> {
        let os = self.os();
        let start = os.tick_ms();
        let offset = dpm::handshake_cell_offset(dpm::SYSTEM_BLOCK_ID)
            + dpm::HandshakeWidth::Bits8.netx_offset();
        loop {
            let netx = NetxSysFlags::from_bits_retain(self.transport().read_u8(offset)? as u16);
            if netx.contains(NetxSysFlags::READY) == ready {
                return Ok(true);
            }
            if os::timed_out(os, start, timeout_ms) {
                return Ok(false);
            }
            os.sleep_ms(RESET_POLL_MS);
        }
    }

    /// Bring every channel's cached flags back in line with the DPM
    pub(crate) fn resync(&self) -> Result<()> {
        for ch in self.channels() {
            ch.resync()?;
        }
        self.read_sync_flags()?;
        if self.irq_active() {
            self.replay_interrupt()?;
        }
        Ok(())
    }
}

impl<O: Os> ChannelRef<'_, O> {
    /// Restart the channel's protocol stack.
    ///
    /// Requests init through the COS protocol, then waits up to `timeout_ms`
    /// for the stack to stop running and for the channel to become ready
    /// again.
    pub fn channel_init(&self, timeout_ms: u32) -> Result<()> {
        if self.is_system() {
            return Err(Error::InvalidCommand);
        }
        let config = self.device.config();
        let _device = lock_timeout(
            self.os(),
            self.device.init_lock(),
            config.init_mutex_timeout_ms,
        )?;
        let _channel = lock_timeout(
            self.os(),
            &self.channel.init_lock,
            config.init_mutex_timeout_ms,
        )?;

        if !self.is_ready()? {
            return Err(Error::NotReady);
        }

        debug!("{}: channel {:?} init", self.device.name(), self.kind());
        self.host_cos_change(
            (AppCos::INITIALIZATION | AppCos::INITIALIZATION_ENABLE).bits(),
            0,
            AppCos::INITIALIZATION_ENABLE.bits(),
            Error::InitTimeout,
            timeout_ms,
        )?;

        let cos_bit = dpm::NETX_COS_BIT;
        let run = CommCos::RUN.bits();
        let ready = CommCos::READY.bits();
        let stopped = self.wait_until(cos_bit, timeout_ms, |st| st.device_cos & run == 0)?;
        let restarted =
            stopped && self.wait_until(cos_bit, timeout_ms, |st| st.device_cos & ready != 0)?;

        self.lock_state().host_cos &= !AppCos::INITIALIZATION.bits();

        if !restarted {
            warn!("{}: channel init timed out", self.device.name());
            return Err(Error::InitTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, IrqMode};
    use crate::dpm::{bit_mask, system_info};
    use crate::os::StdOs;
    use crate::testutil::{SIM_COMM_BLOCK, SimDpm};
    use crate::transport::Transport;
    use std::time::Duration;

    fn wait(cond: impl Fn() -> bool) {
        while !cond() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Device side of a reset: drop ready once the host asks, restart with
    /// `cookie` and come back ready
    fn reset_device(sim: &SimDpm, cookie: [u8; 4]) {
        wait(|| sim.host(0) & HostSysFlags::RESET.bits() != 0);
        sim.set_netx(0, 0);
        std::thread::sleep(Duration::from_millis(5));
        sim.mmio().write(system_info::OFFSET, &cookie).unwrap();
        sim.mmio()
            .write_u8(dpm::handshake_cell_offset(0) + 3, 0)
            .unwrap();
        sim.set_netx(0, NetxSysFlags::READY.bits());
    }

    fn config() -> DeviceConfig {
        DeviceConfig::default()
            .with_reset_timeout(500)
            .with_start_timeout(1000)
            .with_update_timeout(1000)
    }

    #[test]
    fn test_cold_start() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), config()).unwrap();
        let result = std::thread::scope(|s| {
            s.spawn(|| reset_device(&sim, dpm::COOKIE_FIRMWARE));
            device.reset(ResetMode::ColdStart, 0, 0)
        });
        assert_eq!(result, Ok(()));
        assert_eq!(
            sim.mmio().read_u32(system_control::SYSTEM_CONTROL).unwrap(),
            2
        );
        assert_eq!(
            sim.mmio().read_u32(system_control::COMMAND_COS).unwrap(),
            dpm::RESET_COOKIE
        );
        assert!(!device.reset_active());
        assert_eq!(device.system_channel().host_flags(), 0);
        assert_eq!(device.channel(0).unwrap().is_ready(), Ok(true));
    }

    #[test]
    fn test_boot_start_requires_bootloader_cookie() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), config()).unwrap();
        let result = std::thread::scope(|s| {
            s.spawn(|| reset_device(&sim, dpm::COOKIE_BOOTLOADER));
            device.reset(ResetMode::BootStart, 0, 0)
        });
        assert_eq!(result, Ok(()));
        assert!(device.system_info().is_bootloader());
        assert_eq!(
            sim.mmio().read_u32(system_control::SYSTEM_CONTROL).unwrap(),
            3
        );

        let result = std::thread::scope(|s| {
            s.spawn(|| reset_device(&sim, dpm::COOKIE_FIRMWARE));
            device.reset(ResetMode::BootStart, 0, 0)
        });
        assert_eq!(result, Err(Error::FunctionFailed));
        assert!(!device.reset_active());
    }

    #[test]
    fn test_reset_timeout_when_device_stays_ready() {
        let sim = SimDpm::firmware();
        let device = Device::attach(
            sim.mmio(),
            StdOs::new(),
            config().with_reset_timeout(20),
        )
        .unwrap();
        assert_eq!(
            device.reset(ResetMode::ColdStart, 0, 0),
            Err(Error::ResetTimeout)
        );
        assert!(!device.reset_active());
    }

    #[test]
    fn test_app_cpu_managed_waits_for_app_cpu_reset() {
        let sim = SimDpm::firmware();
        let config = config()
            .with_device_class(DeviceClass::AppCpuManaged)
            .with_reset_timeout(10_000);
        let device = Device::attach(sim.mmio(), StdOs::new(), config).unwrap();
        let os = StdOs::new();
        let start = os.tick_ms();
        let result = std::thread::scope(|s| {
            s.spawn(|| reset_device(&sim, dpm::COOKIE_FIRMWARE));
            device.reset(ResetMode::ColdStart, 5, 0)
        });
        assert_eq!(result, Ok(()));
        assert!(os::elapsed_ms(&os, start) < 5_000);
        assert_eq!(
            sim.mmio().read_u32(system_control::SYSTEM_CONTROL).unwrap(),
            2 | (5 << 4)
        );
        assert_eq!(device.channel(0).unwrap().is_ready(), Ok(true));
    }

    #[test]
    fn test_app_cpu_managed_stale_ready_is_not_a_reset() {
        let sim = SimDpm::firmware();
        let config = config()
            .with_device_class(DeviceClass::AppCpuManaged)
            .with_reset_timeout(10_000);
        let device = Device::attach(sim.mmio(), StdOs::new(), config).unwrap();
        let os = StdOs::new();
        let start = os.tick_ms();
        assert_eq!(
            device.reset(ResetMode::ColdStart, 0, 50),
            Err(Error::ResetTimeout)
        );
        assert!(os::elapsed_ms(&os, start) < 5_000);
        assert_ne!(sim.host(0) & HostSysFlags::RESET.bits(), 0);
        assert!(!device.reset_active());
    }

    #[test]
    fn test_update_start_waits_for_second_cycle() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), config()).unwrap();
        let result = std::thread::scope(|s| {
            s.spawn(|| {
                reset_device(&sim, dpm::COOKIE_FIRMWARE);
                std::thread::sleep(Duration::from_millis(20));
                sim.set_netx(0, 0);
                std::thread::sleep(Duration::from_millis(20));
                sim.set_netx(0, NetxSysFlags::READY.bits());
            });
            device.reset(ResetMode::UpdateStart, 0, 0)
        });
        assert_eq!(result, Ok(()));

        // No second cycle
        let result = std::thread::scope(|s| {
            s.spawn(|| reset_device(&sim, dpm::COOKIE_FIRMWARE));
            device.reset(ResetMode::UpdateStart, 0, 0)
        });
        assert_eq!(result, Err(Error::ResetTimeout));
    }

    #[test]
    fn test_prepare_zeroes_cached_flags() {
        let sim = SimDpm::firmware();
        sim.set_netx(SIM_COMM_BLOCK, 0xFFF7);
        let config = DeviceConfig::default().with_irq_mode(IrqMode::Interrupt);
        let device = Device::attach(sim.mmio(), StdOs::new(), config).unwrap();
        let ch = device.channel(0).unwrap();
        ch.toggle_bit(0x0155).unwrap();
        device.system_channel().toggle_bit(0x24).unwrap();
        device.toggle_sync_bit(3).unwrap();
        assert_ne!(ch.netx_flags(), 0);

        device.prepare_reset();
        for ch in device.channels() {
            assert_eq!(ch.host_flags(), 0);
            assert_eq!(ch.netx_flags(), 0);
            assert_eq!(ch.device_cos(), (0, 0));
            assert_eq!(ch.host_cos(), 0);
        }
        assert_eq!(device.sync_flags(), (0, 0));
        assert!(device.reset_active());
    }

    #[test]
    fn test_reset_busy_while_init_held() {
        let sim = SimDpm::firmware();
        let device = Device::attach(
            sim.mmio(),
            StdOs::new(),
            config().with_init_mutex_timeout(10),
        )
        .unwrap();
        let _held = device.init_lock().lock();
        assert_eq!(
            device.reset(ResetMode::ColdStart, 0, 0),
            Err(Error::Busy)
        );
        assert_eq!(
            device.channel(0).unwrap().channel_init(0),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_channel_init() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), config()).unwrap();
        let ch = device.channel(0).unwrap();
        let host_cos = bit_mask(dpm::HOST_COS_BIT);
        let netx_cos = bit_mask(dpm::NETX_COS_BIT);

        let result = std::thread::scope(|s| {
            s.spawn(|| {
                wait(|| sim.pending(SIM_COMM_BLOCK, host_cos));
                assert!(sim.app_cos().contains(AppCos::INITIALIZATION));
                sim.ack(SIM_COMM_BLOCK, host_cos);

                sim.set_comm_cos(CommCos::empty());
                sim.toggle_netx(SIM_COMM_BLOCK, netx_cos);
                wait(|| !sim.pending(SIM_COMM_BLOCK, netx_cos));

                std::thread::sleep(Duration::from_millis(10));
                sim.set_comm_cos(CommCos::READY | CommCos::RUN);
                sim.toggle_netx(SIM_COMM_BLOCK, netx_cos);
            });
            ch.channel_init(1000)
        });
        assert_eq!(result, Ok(()));
        assert_eq!(ch.host_cos() & AppCos::INITIALIZATION.bits(), 0);
        assert_eq!(ch.is_running(), Ok(true));
    }

    #[test]
    fn test_channel_init_timeout() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), config()).unwrap();
        let ch = device.channel(0).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                let host_cos = bit_mask(dpm::HOST_COS_BIT);
                wait(|| sim.pending(SIM_COMM_BLOCK, host_cos));
                sim.ack(SIM_COMM_BLOCK, host_cos);
            });
            // Acknowledged, but the stack never stops
            assert_eq!(ch.channel_init(200), Err(Error::InitTimeout));
        });
        assert_eq!(ch.host_cos() & AppCos::INITIALIZATION.bits(), 0);
    }
}

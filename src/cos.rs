//! Host COS changes.
//!
//! The host publishes application state (bus on, application ready, DMA,
//! configuration lock, channel init) through its COS word.  A change is a
//! command: the host writes the new word and toggles its COS command bit, and
//! the device acknowledges by toggling its copy back.  Only one change can be
//! in flight per channel.
//!
//! Some COS bits are one-shot "enable" bits, telling the device which of the
//! other bits the command is about.  These are cleared from the cached word as
//! soon as the command has been issued.
//!
//! A change requested with a timeout of 0 while a previous command is still
//! outstanding is merged into the cached word and written later, by the
//! interrupt bottom-half or by [`Device::check_cos_flags()`].  The request
//! itself reports success.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{BitState, ChannelRef, FlagState};
use crate::device::Device;
use crate::dpm::{self, AppCos, bit_mask};
use crate::os::{self, Os};
use crate::{Error, Result};

impl<O: Os> ChannelRef<'_, O> {
    /// Write the cached host COS word and issue the COS command.  Must be
    /// called with the state lock held and the command bit available.
    fn issue_host_cos_locked(&self, st: &mut FlagState, post_clear: u32) -> Result<()> {
        self.transport()
            .write_u32(self.channel.host_cos_offset, st.host_cos)?;
        st.last_host_cos = st.host_cos;
        self.toggle_bit_locked(st, bit_mask(dpm::HOST_COS_BIT))?;
        st.host_cos &= !(post_clear | st.pending_post_clear);
        st.pending_post_clear = 0;
        st.cos_pending = false;
        trace!(
            "{}: host COS {:#010X} written",
            self.device.name(),
            st.last_host_cos
        );
        Ok(())
    }

    /// Issue a deferred COS change, if there is one and the command bit is
    /// available.  Must be called with the state lock held.
    pub(crate) fn flush_deferred_cos_locked(&self, st: &mut FlagState) -> Result<()> {
        if st.cos_pending && st.bit_state(dpm::HOST_COS_BIT, BitState::Equal) {
            debug!("{}: issuing deferred COS change", self.device.name());
            self.issue_host_cos_locked(st, 0)?;
        }
        Ok(())
    }

    /// Change the host COS flags: set the bits in `set`, clear those in
    /// `clear`, and drop the bits in `post_clear` again once the command has
    /// been issued.
    ///
    /// Waits up to `timeout_ms` for the COS command bit, then again for the
    /// device to acknowledge, returning `signal_err` if it does not.
    ///
    /// With a `timeout_ms` of 0 this never fails on a busy command bit: the
    /// change is recorded and issued as soon as the bit becomes available.
    pub fn host_cos_change(
        &self,
        set: u32,
        clear: u32,
        post_clear: u32,
        signal_err: Error,
        timeout_ms: u32,
    ) -> Result<()> {
        let os = self.os();
        let start = os.tick_ms();
        loop {
            let left = (timeout_ms as u64).saturating_sub(os::elapsed_ms(os, start)) as u32;
            let free = self.wait_for_bit_state(dpm::HOST_COS_BIT, BitState::Equal, left)?;

            // Another caller may have issued a command since the wait
            let mut st = self.lock_state();
            if free && st.bit_state(dpm::HOST_COS_BIT, BitState::Equal) {
                st.host_cos = (st.host_cos | set) & !clear;
                self.issue_host_cos_locked(&mut st, post_clear)?;
                break;
            }
            if timeout_ms == 0 {
                st.host_cos = (st.host_cos | set) & !clear;
                st.pending_post_clear |= post_clear;
                st.cos_pending = true;
                debug!(
                    "{}: COS change {:#010X} deferred",
                    self.device.name(),
                    st.host_cos
                );
                return Ok(());
            }
            if !free || os::timed_out(os, start, timeout_ms) {
                debug!("{}: COS command bit busy", self.device.name());
                return Err(Error::FunctionFailed);
            }
        }

        if timeout_ms != 0
            && !self.wait_for_bit_state(dpm::HOST_COS_BIT, BitState::Equal, timeout_ms)?
        {
            warn!(
                "{}: COS change not acknowledged: {signal_err}",
                self.device.name()
            );
            return Err(signal_err);
        }
        Ok(())
    }

    fn comm_only(&self) -> Result<()> {
        if self.is_system() {
            Err(Error::InvalidCommand)
        } else {
            Ok(())
        }
    }

    /// Switch bus communication on or off
    pub fn set_bus_state(&self, on: bool, timeout_ms: u32) -> Result<()> {
        self.comm_only()?;
        let (set, clear) = if on {
            (AppCos::BUS_ON | AppCos::BUS_ON_ENABLE, AppCos::empty())
        } else {
            (AppCos::BUS_ON_ENABLE, AppCos::BUS_ON)
        };
        self.host_cos_change(
            set.bits(),
            clear.bits(),
            AppCos::BUS_ON_ENABLE.bits(),
            Error::BusStateTimeout,
            timeout_ms,
        )
    }

    /// Tell the device whether the host application is ready.  Sets the host
    /// ready handshake flag as well as the application ready COS flag.
    pub fn set_host_state(&self, ready: bool, timeout_ms: u32) -> Result<()> {
        self.comm_only()?;
        let ready_mask = bit_mask(dpm::READY_BIT);
        {
            let mut st = self.lock_state();
            if ready != (st.host_flags & ready_mask != 0) {
                self.toggle_bit_locked(&mut st, ready_mask)?;
            }
        }
        let app_ready = AppCos::APPLICATION_READY.bits();
        let (set, clear) = if ready { (app_ready, 0) } else { (0, app_ready) };
        self.host_cos_change(set, clear, 0, Error::HostStateTimeout, timeout_ms)
    }

    /// Switch DMA mode on or off.  Switching on requires DMA buffers to have
    /// been configured for the channel.
    pub fn set_dma_state(&self, on: bool, timeout_ms: u32) -> Result<()> {
        self.comm_only()?;
        if on && self.channel.dma.lock().iter().all(Option::is_none) {
            return Err(Error::InvalidCommand);
        }
        let (set, clear) = if on {
            (AppCos::DMA | AppCos::DMA_ENABLE, AppCos::empty())
        } else {
            (AppCos::DMA_ENABLE, AppCos::DMA)
        };
        self.host_cos_change(
            set.bits(),
            clear.bits(),
            AppCos::DMA_ENABLE.bits(),
            Error::DmaStateTimeout,
            timeout_ms,
        )
    }

    /// Lock or unlock the channel's configuration
    pub fn lock_config(&self, lock: bool, timeout_ms: u32) -> Result<()> {
        self.comm_only()?;
        let (set, clear) = if lock {
            (
                AppCos::LOCK_CONFIGURATION | AppCos::LOCK_CONFIGURATION_ENABLE,
                AppCos::empty(),
            )
        } else {
            (
                AppCos::LOCK_CONFIGURATION_ENABLE,
                AppCos::LOCK_CONFIGURATION,
            )
        };
        self.host_cos_change(
            set.bits(),
            clear.bits(),
            AppCos::LOCK_CONFIGURATION_ENABLE.bits(),
            Error::ConfigLockTimeout,
            timeout_ms,
        )
    }

    /// Cached host COS flags, as they will be written with the next command
    pub fn host_cos(&self) -> u32 {
        self.lock_state().host_cos
    }
}

impl<O: Os> Device<O> {
    /// Periodic sweep: refresh the cached flags of every channel and issue
    /// deferred COS changes.
    ///
    /// Skipped while a reset or channel init holds the init mutex.
    pub fn check_cos_flags(&self) -> Result<()> {
        let Some(_init) = self.init_lock().try_lock() else {
            trace!("{}: init in progress, COS check skipped", self.name());
            return Ok(());
        };
        for ch in self.channels() {
            let mut st = ch.lock_state();
            if !ch.irq_driven() {
                ch.read_handshake_flags_locked(&mut st, false)?;
            }
            ch.flush_deferred_cos_locked(&mut st)?;
        }
        Ok(())
    }
}

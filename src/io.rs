//! Cyclic process data exchange through IO areas.
//!
//! A communication channel carries up to four IO areas: a normal and a high
//! priority area in each direction.  Each is guarded by one handshake bit, and
//! the device tells the host in the common status block which side controls
//! the exchange:
//!
//! - host controlled: the host may access the area while the bit pair is
//!   equal, and hands it over by toggling its copy
//! - device controlled: the host may access the area while the pair is
//!   unequal, and hands it back by toggling
//! - uncontrolled: no handshake, the area may be accessed at any time
//!
//! Output areas are written by the host, input areas are read.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{BitState, ChannelRef};
use crate::dpm::{self, bit_mask, comm_channel};
use crate::os::Os;
use crate::{Error, Result};

/// Handshake mode values in the common status block
pub const IO_MODE_DEFAULT: u8 = 0;
pub const IO_MODE_BUFFERED_DEVICE_CONTROLLED: u8 = 2;
pub const IO_MODE_UNCONTROLLED: u8 = 3;
pub const IO_MODE_BUFFERED_HOST_CONTROLLED: u8 = 4;

/// IO area identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAreaId {
    Pd0Output,
    Pd0Input,
    Pd1Output,
    Pd1Input,
}

impl IoAreaId {
    pub fn is_output(self) -> bool {
        matches!(self, IoAreaId::Pd0Output | IoAreaId::Pd1Output)
    }

    /// Handshake bit guarding the area
    pub fn bit(self) -> u8 {
        match self {
            IoAreaId::Pd0Output => dpm::PD0_OUT_BIT,
            IoAreaId::Pd0Input => dpm::PD0_IN_BIT,
            IoAreaId::Pd1Output => dpm::PD1_OUT_BIT,
            IoAreaId::Pd1Input => dpm::PD1_IN_BIT,
        }
    }
}

/// An IO area of a communication channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoArea {
    pub(crate) id: IoAreaId,
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) bit: u8,
    pub(crate) policy: Option<BitState>,
}

impl IoArea {
    /// Bit state in which the host owns an area, for a handshake mode.
    /// `None` for uncontrolled areas.
    pub fn policy_for_mode(mode: u8) -> Option<BitState> {
        match mode {
            IO_MODE_UNCONTROLLED => None,
            IO_MODE_BUFFERED_DEVICE_CONTROLLED => Some(BitState::NotEqual),
            IO_MODE_DEFAULT | IO_MODE_BUFFERED_HOST_CONTROLLED => Some(BitState::Equal),
            other => {
                warn!("Unknown IO handshake mode {other}, using host controlled");
                Some(BitState::Equal)
            }
        }
    }

    fn new(id: IoAreaId, offset: u32, size: u32, mode: u8) -> Self {
        Self {
            id,
            offset,
            size,
            bit: id.bit(),
            policy: Self::policy_for_mode(mode),
        }
    }

    /// Lay out the IO areas of a channel, from the end of its receive mailbox
    /// (`start`) to the end of the channel (`end`): high priority output and
    /// input, a reserved block, then the normal output and input areas
    /// sharing what is left.
    pub(crate) fn layout(start: u32, end: u32, in_mode: u8, out_mode: u8) -> Vec<Self> {
        let pd1_out = start;
        let pd1_in = pd1_out + comm_channel::PD1_SIZE;
        let pd0_out = pd1_in + comm_channel::PD1_SIZE + comm_channel::RESERVED_AFTER_PD1;
        let Some(remaining) = end.checked_sub(pd0_out) else {
            debug!("Channel ending at {end:#06X} too small for IO areas");
            return Vec::new();
        };
        let pd0_size = remaining / 2;
        alloc::vec![
            Self::new(IoAreaId::Pd0Output, pd0_out, pd0_size, out_mode),
            Self::new(IoAreaId::Pd0Input, pd0_out + pd0_size, pd0_size, in_mode),
            Self::new(IoAreaId::Pd1Output, pd1_out, comm_channel::PD1_SIZE, out_mode),
            Self::new(IoAreaId::Pd1Input, pd1_in, comm_channel::PD1_SIZE, in_mode),
        ]
    }

    pub fn id(&self) -> IoAreaId {
        self.id
    }

    /// DPM offset of the area
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bit state in which the host may access the area
    pub fn policy(&self) -> Option<BitState> {
        self.policy
    }
}

impl<'a, O: Os> ChannelRef<'a, O> {
    /// IO areas of the channel
    pub fn io_areas(&self) -> &'a [IoArea] {
        &self.channel.io_areas
    }

    pub fn io_area(&self, id: IoAreaId) -> Result<&'a IoArea> {
        self.channel
            .io_areas
            .iter()
            .find(|area| area.id == id)
            .ok_or(Error::InvalidCommand)
    }

    fn check_io_access(&self, area: &IoArea, offset: u32, len: usize) -> Result<()> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= area.size => {}
            _ => return Err(Error::InvalidParameter),
        }
        if !self.is_ready()? {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Wait until the host owns `area`
    fn acquire_io(&self, area: &IoArea, timeout_ms: u32) -> Result<()> {
        if let Some(state) = area.policy {
            if !self.wait_for_bit_state(area.bit, state, timeout_ms)? {
                debug!(
                    "{}: IO area {:?} not available",
                    self.device.name(),
                    area.id
                );
                return Err(Error::FunctionFailed);
            }
        }
        Ok(())
    }

    /// Hand `area` back to the device
    fn release_io(&self, area: &IoArea) -> Result<()> {
        if area.policy.is_some() {
            let mut st = self.lock_state();
            self.toggle_bit_locked(&mut st, bit_mask(area.bit))?;
        }
        Ok(())
    }

    /// Read input data from `offset` within input area `id`.
    ///
    /// Waits up to `timeout_ms` for the area, then hands it back to the
    /// device.
    pub fn io_read(&self, id: IoAreaId, offset: u32, buf: &mut [u8], timeout_ms: u32) -> Result<()> {
        let area = self.io_area(id)?;
        if id.is_output() {
            return Err(Error::InvalidCommand);
        }
        self.check_io_access(area, offset, buf.len())?;
        self.acquire_io(area, timeout_ms)?;
        self.transport().read(area.offset + offset, buf)?;
        self.release_io(area)
    }

    /// Write output data at `offset` within output area `id`.
    ///
    /// Waits up to `timeout_ms` for the area, then hands it to the device.
    pub fn io_write(&self, id: IoAreaId, offset: u32, data: &[u8], timeout_ms: u32) -> Result<()> {
        let area = self.io_area(id)?;
        if !id.is_output() {
            return Err(Error::InvalidCommand);
        }
        self.check_io_access(area, offset, data.len())?;
        self.acquire_io(area, timeout_ms)?;
        self.transport().write(area.offset + offset, data)?;
        self.release_io(area)
    }

    /// Read back the last data written to output area `id`, without any
    /// handshake
    pub fn io_read_output(&self, id: IoAreaId, offset: u32, buf: &mut [u8]) -> Result<()> {
        let area = self.io_area(id)?;
        if !id.is_output() {
            return Err(Error::InvalidCommand);
        }
        self.check_io_access(area, offset, buf.len())?;
        self.transport().read(area.offset + offset, buf)
    }
}

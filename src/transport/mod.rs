//! Byte and word access to the DPM.
//!
//! Everything the engine does to the device goes through a [`Transport`]: it
//! reads and writes byte ranges at DPM offsets.  The 8/16/32-bit helpers are
//! layered on top of [`Transport::read()`] and [`Transport::write()`] and
//! convert from/to little-endian.  Implementations that can perform single
//! word accesses (such as [`MemoryMapped`]) override them, as handshake words
//! must be read and written in one access.
//!
//! Two implementations are provided:
//! - [`MemoryMapped`] - the DPM is mapped into the address space
//! - [`SerialDpm`] - the DPM is reached over an SPI link, using framing
//!   specific to the controller family, detected at creation
//!
//! The transport is chosen once, when the device is attached, and stored with
//! the device.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod mmio;
pub mod serial;

pub use mmio::MemoryMapped;
pub use serial::{ChipFamily, SerialDpm, SpiBus};

use crate::Result;

/// Access to the DPM.
///
/// Offsets are DPM byte offsets.  Implementations must be callable from any
/// context the engine runs in, including the interrupt top-half, so must not
/// block for long.
pub trait Transport: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `offset`
    fn write(&self, offset: u32, data: &[u8]) -> Result<()>;

    fn read_u8(&self, offset: u32) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, offset: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, offset: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u8(&self, offset: u32, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    fn write_u16(&self, offset: u32, value: u16) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

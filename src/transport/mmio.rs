//! Directly mapped DPM.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ptr::NonNull;

use crate::transport::Transport;
use crate::{Error, Result};

/// [`Transport`] over a DPM mapped into the address space.
///
/// Every access is volatile.  Aligned 16 and 32-bit accesses are performed as
/// single loads/stores.
///
/// This is a plain handle to the mapping, so it is `Copy`: the mapping itself
/// is owned by whoever mapped it.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapped {
    base: NonNull<u8>,
    len: usize,
}

// The region is device memory shared with another bus master anyway.  All
// accesses are volatile, and ownership of individual words is arbitrated by the
// handshake protocol.
unsafe impl Send for MemoryMapped {}
unsafe impl Sync for MemoryMapped {}

impl MemoryMapped {
    /// Create a new instance over `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for volatile reads and writes of `len` bytes for
    /// as long as this object, or any copy of it, exists.
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<usize> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.len => Ok(start),
            _ => Err(Error::InvalidParameter),
        }
    }

    fn aligned(&self, start: usize, align: usize) -> bool {
        (self.base.as_ptr() as usize + start) % align == 0
    }
}

impl Transport for MemoryMapped {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len())?;
        for (ii, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { core::ptr::read_volatile(self.base.as_ptr().add(start + ii)) };
        }
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        let start = self.check_range(offset, data.len())?;
        for (ii, byte) in data.iter().enumerate() {
            unsafe { core::ptr::write_volatile(self.base.as_ptr().add(start + ii), *byte) };
        }
        Ok(())
    }

    fn read_u16(&self, offset: u32) -> Result<u16> {
        let start = self.check_range(offset, 2)?;
        if !self.aligned(start, 2) {
            let mut buf = [0u8; 2];
            self.read(offset, &mut buf)?;
            return Ok(u16::from_le_bytes(buf));
        }
        let value =
            unsafe { core::ptr::read_volatile(self.base.as_ptr().add(start) as *const u16) };
        Ok(u16::from_le(value))
    }

    fn read_u32(&self, offset: u32) -> Result<u32> {
        let start = self.check_range(offset, 4)?;
        if !self.aligned(start, 4) {
            let mut buf = [0u8; 4];
            self.read(offset, &mut buf)?;
            return Ok(u32::from_le_bytes(buf));
        }
        let value =
            unsafe { core::ptr::read_volatile(self.base.as_ptr().add(start) as *const u32) };
        Ok(u32::from_le(value))
    }

    fn write_u16(&self, offset: u32, value: u16) -> Result<()> {
        let start = self.check_range(offset, 2)?;
        if !self.aligned(start, 2) {
            return self.write(offset, &value.to_le_bytes());
        }
        unsafe {
            core::ptr::write_volatile(self.base.as_ptr().add(start) as *mut u16, value.to_le())
        };
        Ok(())
    }

    fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        let start = self.check_range(offset, 4)?;
        if !self.aligned(start, 4) {
            return self.write(offset, &value.to_le_bytes());
        }
        unsafe {
            core::ptr::write_volatile(self.base.as_ptr().add(start) as *mut u32, value.to_le())
        };
        Ok(())
    }
}

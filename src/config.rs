//! Per-device configuration.
//!
//! A [`DeviceConfig`] is passed by value into [`crate::device::Device::attach()`]
//! and is fixed for the lifetime of the device.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::string::String;

/// Default time for the device to leave the ready state after a reset request
pub const DEFAULT_RESET_TIMEOUT_MS: u32 = 3_000;
/// Default time for the device to come back after a cold or boot start
pub const DEFAULT_START_TIMEOUT_MS: u32 = 10_000;
/// Default time for an update start, which includes applying the update
pub const DEFAULT_UPDATE_TIMEOUT_MS: u32 = 60_000;
/// Default time to wait for an init mutex
pub const DEFAULT_INIT_MUTEX_TIMEOUT_MS: u32 = 5_000;
/// Default number of packets a transfer inspects while looking for its answer
pub const DEFAULT_TRANSFER_RETRIES: u32 = 10;

/// How the engine learns about handshake changes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    /// Re-read the handshake cells from the DPM whenever state is needed
    #[default]
    Polling,
    /// Rely on the interrupt split to refresh cached state and wake waiters
    Interrupt,
}

/// Device class, as far as reset signalling is concerned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// The communication controller resets itself when asked
    #[default]
    Standalone,
    /// An auxiliary application CPU owns the physical reset line, and performs
    /// the reset after the handshake
    AppCpuManaged,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Name used in log output
    pub name: String,
    /// Interrupt or polling operation
    pub irq_mode: IrqMode,
    /// Device class
    pub device_class: DeviceClass,
    /// The board shares its interrupt line and exposes the global register
    /// block (interrupt status/acknowledge and DMA channel setup) at the end of
    /// the DPM
    pub shared_irq_line: bool,
    /// Time for the device to leave the ready state after a reset request
    pub reset_timeout_ms: u32,
    /// Time for the device to become ready after a cold or boot start
    pub start_timeout_ms: u32,
    /// Time for an update start to complete
    pub update_timeout_ms: u32,
    /// Time to wait for an init mutex
    pub init_mutex_timeout_ms: u32,
    /// Packets a transfer inspects before giving up on its answer
    pub transfer_retries: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::from("cifX0"),
            irq_mode: IrqMode::default(),
            device_class: DeviceClass::default(),
            shared_irq_line: false,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            update_timeout_ms: DEFAULT_UPDATE_TIMEOUT_MS,
            init_mutex_timeout_ms: DEFAULT_INIT_MUTEX_TIMEOUT_MS,
            transfer_retries: DEFAULT_TRANSFER_RETRIES,
        }
    }
}

impl DeviceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            ..Self::default()
        }
    }

    pub fn with_irq_mode(mut self, irq_mode: IrqMode) -> Self {
        self.irq_mode = irq_mode;
        self
    }

    pub fn with_device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn with_shared_irq_line(mut self, shared: bool) -> Self {
        self.shared_irq_line = shared;
        self
    }

    pub fn with_reset_timeout(mut self, ms: u32) -> Self {
        self.reset_timeout_ms = ms;
        self
    }

    pub fn with_start_timeout(mut self, ms: u32) -> Self {
        self.start_timeout_ms = ms;
        self
    }

    pub fn with_update_timeout(mut self, ms: u32) -> Self {
        self.update_timeout_ms = ms;
        self
    }

    pub fn with_init_mutex_timeout(mut self, ms: u32) -> Self {
        self.init_mutex_timeout_ms = ms;
        self
    }

    pub fn with_transfer_retries(mut self, retries: u32) -> Self {
        self.transfer_retries = retries;
        self
    }
}

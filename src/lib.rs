//! Host-side driver engine for dual-port memory (DPM) based fieldbus communication
//! controllers.
//!
//! The host and the embedded controller share a memory region, the DPM.  Everything
//! the two sides agree on is negotiated through that region: packets are exchanged
//! through fixed-capacity mailboxes, shared state changes through handshake bits and
//! "change of state" (COS) flags, and the controller is reset and restarted by
//! writing well-known control words.
//!
//! `no_std`.  Requires `alloc`.  The `std` feature (default) adds [`os::StdOs`], a
//! ready-made binding of the OS primitives the engine consumes.
//!
//! ## Architecture
//!
//! The DPM is split into blocks:
//! - **System channel**: device identification, channel layout, system mailboxes and
//!   the reset control words
//! - **Handshake channel**: one handshake cell per block, each cell holding a host
//!   flags word and a device flags word (8 or 16 bits wide)
//! - **Communication channels**: one per fieldbus protocol stack, each with its own
//!   mailboxes, COS words and process data (IO) areas
//!
//! Each handshake bit is a pair: one copy in the host flags, one in the device
//! flags.  Only the owning side toggles its copy; the other side only reads it.
//! Whether the pair is "equal" or "not equal" tells both sides who currently owns
//! the resource the bit guards (a mailbox, an IO area, the COS word).
//!
//! The same protocol runs over directly mapped memory
//! ([`transport::MemoryMapped`]) or over a serial SPI link with per-chip framing
//! ([`transport::SerialDpm`]).
//!
//! ## Modules
//!
//! - [`transport`] - Byte/word access to the DPM, memory mapped or serial
//! - [`dpm`] - DPM layout, handshake flag sets, cookies and information blocks
//! - [`device`] - The device instance: attach, channel arena, sync bits, DMA
//! - [`channel`] - Channel instance and the handshake engine
//! - [`mailbox`] - Packet put/get/transfer
//! - [`cos`] - Host COS change protocol (bus on/off, host ready, DMA, config lock)
//! - [`reset`] - Cold/boot/update start and channel init
//! - [`irq`] - Interrupt top-half ([`device::Device::isr`]) and bottom-half
//!   ([`device::Device::dsr`])
//! - [`io`] - Cyclic process data exchange through IO areas
//! - [`packet`] - Packet header layout and little-endian encode/decode
//! - [`os`] - OS primitives consumed by the engine
//! - [`config`] - Per-device configuration
//!
//! ## Getting Started
//!
//! 1. Map the DPM (or open the SPI bus) and wrap it in a [`transport::Transport`]
//! 2. Create a [`config::DeviceConfig`]
//! 3. Call [`device::Device::attach()`]
//! 4. In interrupt mode, route the interrupt to [`device::Device::isr()`] and, when
//!   it asks for it, run [`device::Device::dsr()`] from thread context.  Then call
//!   [`device::Device::enable_irq()`]
//! 5. In polling mode, call [`device::Device::check_cos_flags()`] periodically
//! 6. Obtain channels with [`device::Device::channel()`] and exchange packets with
//!   [`channel::ChannelRef::put_packet()`], [`channel::ChannelRef::get_packet()`]
//!   or [`channel::ChannelRef::transfer_packet()`]
//!
//! ## Features
//!
//! Default features:
//! - `std` - Provide [`os::StdOs`], built on `std::thread` and `std::sync`.
//!
//! Compile with `--no-default-features` and supply your own [`os::Os`] for
//! environments without `std`.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod channel;
pub mod config;
pub mod cos;
pub mod device;
pub mod dpm;
pub mod io;
pub mod irq;
pub mod mailbox;
pub mod os;
pub mod packet;
pub mod reset;
pub mod transport;

#[cfg(test)]
mod testutil;

/// Driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Channel or device is not in a state that permits the operation
    #[error("channel not ready")]
    NotReady,
    /// Send mailbox still holds a packet the device has not taken
    #[error("send mailbox full")]
    MailboxFull,
    /// Packet does not fit into the mailbox
    #[error("mailbox too short for packet")]
    MailboxTooShort,
    /// Received packet was truncated to fit the caller's buffer
    #[error("buffer too short for packet")]
    BufferTooShort,
    /// No packet arrived in time
    #[error("no packet available")]
    NoPacket,
    /// No matching answer arrived in time
    #[error("timeout waiting for answer packet")]
    GetTimeout,
    /// Device did not leave or re-enter the ready state in time
    #[error("reset timeout")]
    ResetTimeout,
    /// A handshake acknowledge was not observed in time
    #[error("function failed")]
    FunctionFailed,
    /// Device did not acknowledge a bus state change
    #[error("bus state change not acknowledged")]
    BusStateTimeout,
    /// Device did not acknowledge a host state change
    #[error("host state change not acknowledged")]
    HostStateTimeout,
    /// Device did not acknowledge a DMA state change
    #[error("DMA state change not acknowledged")]
    DmaStateTimeout,
    /// Device did not acknowledge a configuration lock change
    #[error("configuration lock change not acknowledged")]
    ConfigLockTimeout,
    /// Channel did not complete its initialization in time
    #[error("channel init timeout")]
    InitTimeout,
    /// Init mutex or mailbox could not be obtained in time
    #[error("device busy")]
    Busy,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,
    /// Invalid command
    #[error("invalid command")]
    InvalidCommand,
    /// Buffer size invalid for the operation
    #[error("invalid buffer size")]
    InvalidBufferSize,
    /// No such channel
    #[error("invalid channel")]
    InvalidChannel,
    /// DPM content is unreadable or does not carry a known cookie
    #[error("invalid DPM content")]
    InvalidContent,
    /// Serial chip detection failed
    #[error("unknown serial DPM chip")]
    UnknownChip,
    /// Transport I/O error
    #[error("transport I/O error")]
    Io,
}

/// Type to represent the result of a driver operation
pub type Result<T> = core::result::Result<T, Error>;

//! DPM layout, handshake flag sets, cookies and information blocks.
//!
//! All multi-byte fields in the DPM are little-endian, whatever the host byte
//! order.  Offsets are byte offsets from the start of the DPM unless stated
//! otherwise.
//!
//! ```text
//! 0x0000 System channel (0x200)
//!        0x000 system information block (0x30)
//!        0x030 channel information blocks (8 x 0x10)
//!        0x0B0 system control block (0x08)
//!        0x0B8 system status block (0x40)
//!        0x0F8 system send mailbox (4 + 124)
//!        0x17C system receive mailbox (4 + 124)
//! 0x0200 Handshake channel (0x100, one 4-byte cell per block id)
//! 0x0300 Communication channel 0, then 1, ... (sizes from their info blocks)
//! ...
//! end-0x100 Global register block (only on boards with a shared interrupt line)
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;

use crate::{Error, Result};

/// Cookie at the start of the DPM while the bootloader is active
pub const COOKIE_BOOTLOADER: [u8; 4] = *b"BOOT";
/// Cookie at the start of the DPM while a firmware is active
pub const COOKIE_FIRMWARE: [u8; 4] = *b"netX";
/// What the first DPM word reads as when the DPM has no valid content (device
/// absent, in reset, or a different device on a shared line)
pub const INVALID_CONTENT: u32 = 0xFFFF_FFFF;

/// Start of the system channel
pub const SYSTEM_CHANNEL_OFFSET: u32 = 0x000;
/// Size of the system channel
pub const SYSTEM_CHANNEL_SIZE: u32 = 0x200;
/// Start of the handshake channel
pub const HANDSHAKE_CHANNEL_OFFSET: u32 = 0x200;
/// Size of the handshake channel
pub const HANDSHAKE_CHANNEL_SIZE: u32 = 0x100;
/// Where the first communication channel starts
pub const FIRST_COMM_CHANNEL_OFFSET: u32 = HANDSHAKE_CHANNEL_OFFSET + HANDSHAKE_CHANNEL_SIZE;

/// Size of a handshake cell
pub const HANDSHAKE_CELL_SIZE: u32 = 4;
/// Number of handshake cells in the handshake channel
pub const MAX_HANDSHAKE_CELLS: usize = (HANDSHAKE_CHANNEL_SIZE / HANDSHAKE_CELL_SIZE) as usize;
/// Number of handshake bits per flags word
pub const HANDSHAKE_BITS: usize = 16;

/// Block id of the system channel
pub const SYSTEM_BLOCK_ID: u8 = 0;
/// Block id whose handshake cell carries the device-wide sync flags
pub const SYNC_BLOCK_ID: u8 = 1;
/// Block id of the first communication channel
pub const FIRST_COMM_BLOCK_ID: u8 = 2;

/// Offset of the handshake cell of a block
pub const fn handshake_cell_offset(block_id: u8) -> u32 {
    HANDSHAKE_CHANNEL_OFFSET + block_id as u32 * HANDSHAKE_CELL_SIZE
}

/// System information block field offsets
pub mod system_info {
    pub const OFFSET: u32 = 0x000;
    pub const SIZE: usize = 0x30;

    pub const COOKIE: usize = 0x00;
    pub const DPM_TOTAL_SIZE: usize = 0x04;
    pub const DEVICE_NUMBER: usize = 0x08;
    pub const SERIAL_NUMBER: usize = 0x0C;
    pub const HW_OPTIONS: usize = 0x10;
    pub const MANUFACTURER: usize = 0x18;
    pub const PRODUCTION_DATE: usize = 0x1A;
    pub const LICENSE_FLAGS_1: usize = 0x1C;
    pub const LICENSE_FLAGS_2: usize = 0x20;
    pub const LICENSE_ID: usize = 0x24;
    pub const LICENSE_FLAGS: usize = 0x26;
    pub const DEVICE_CLASS: usize = 0x28;
    pub const HW_REVISION: usize = 0x2A;
    pub const HW_COMPATIBILITY: usize = 0x2B;
    pub const DEV_ID_NUMBER: usize = 0x2C;
}

/// Channel information block layout
pub mod channel_info {
    pub const OFFSET: u32 = 0x030;
    pub const SIZE: usize = 0x10;
    pub const COUNT: usize = 8;

    pub const CHANNEL_TYPE: usize = 0x00;
    pub const CHANNEL_ID: usize = 0x01;
    pub const HANDSHAKE_SIZE_POSITION: usize = 0x02;
    pub const NUMBER_OF_BLOCKS: usize = 0x03;
    pub const CHANNEL_SIZE: usize = 0x04;
    pub const COMMUNICATION_CLASS: usize = 0x08;
    pub const PROTOCOL_CLASS: usize = 0x0A;
    pub const CONFORMANCE_CLASS: usize = 0x0C;
    pub const MAILBOX_SIZE: usize = 0x0E;

    /// High nibble of the handshake size/position byte
    pub const HANDSHAKE_SIZE_MASK: u8 = 0xF0;
    pub const HANDSHAKE_SIZE_8BIT: u8 = 0x10;
    pub const HANDSHAKE_SIZE_16BIT: u8 = 0x20;
}

/// System control block, written by the host
pub mod system_control {
    pub const OFFSET: u32 = 0x0B0;
    /// Host COS word of the system channel.  Also receives the reset cookie.
    pub const COMMAND_COS: u32 = OFFSET;
    /// Reset mode and parameter
    pub const SYSTEM_CONTROL: u32 = OFFSET + 0x04;
}

/// System status block, written by the device
pub mod system_status {
    pub const OFFSET: u32 = 0x0B8;
    pub const SYSTEM_COS: u32 = OFFSET;
    pub const SYSTEM_STATUS: u32 = OFFSET + 0x04;
    pub const SYSTEM_ERROR: u32 = OFFSET + 0x08;
    pub const BOOT_ERROR: u32 = OFFSET + 0x0C;
    pub const TIME_SINCE_START: u32 = OFFSET + 0x10;
    pub const CPU_LOAD: u32 = OFFSET + 0x14;
    pub const HW_FEATURES: u32 = OFFSET + 0x18;
    /// Discriminant word followed by eight register words
    pub const EXCEPTION_INFO: u32 = OFFSET + 0x1C;
    pub const EXCEPTION_INFO_WORDS: usize = 9;
}

/// Mailbox layout: a 16-bit packet counter, 16 reserved bits, then the data
pub mod mailbox {
    pub const COUNTER: u32 = 0x00;
    pub const DATA: u32 = 0x04;
    pub const HEADER_SIZE: u32 = 0x04;

    pub const SYSTEM_SEND: u32 = 0x0F8;
    pub const SYSTEM_RECV: u32 = 0x17C;
    pub const SYSTEM_SIZE: u32 = 124;
}

/// Communication channel layout, relative to the channel start
pub mod comm_channel {
    /// Application COS word, written by the host
    pub const APPLICATION_COS: u32 = 0x000;
    /// Device watchdog word, written by the host
    pub const DEVICE_WATCHDOG: u32 = 0x004;
    /// Common status block, written by the device
    pub const COMMON_STATUS: u32 = 0x008;
    /// Send mailbox start
    pub const SEND_MAILBOX: u32 = 0x200;

    /// High priority output/input area size
    pub const PD1_SIZE: u32 = 0x40;
    /// Reserved space between the high priority and normal areas
    pub const RESERVED_AFTER_PD1: u32 = 0x100;
}

/// Common status block field offsets, relative to the block start
pub mod common_status {
    pub const SIZE: usize = 0x40;

    pub const COMMUNICATION_COS: usize = 0x00;
    pub const COMMUNICATION_STATE: usize = 0x04;
    pub const COMMUNICATION_ERROR: usize = 0x08;
    pub const VERSION: usize = 0x0C;
    pub const WATCHDOG_TIME: usize = 0x0E;
    pub const PD_IN_HANDSHAKE_MODE: usize = 0x10;
    pub const PD_IN_SOURCE: usize = 0x11;
    pub const PD_OUT_HANDSHAKE_MODE: usize = 0x12;
    pub const PD_OUT_SOURCE: usize = 0x13;
    pub const HOST_WATCHDOG: usize = 0x14;
    pub const ERROR_COUNT: usize = 0x18;
}

/// Global register block, at the end of the DPM on boards with a shared
/// interrupt line, relative to the block start
pub mod global_regs {
    pub const SIZE: u32 = 0x100;

    /// Pending interrupt sources.  Write 1s to acknowledge.
    pub const IRQ_STATUS: u32 = 0x00;
    pub const IRQ_ENABLE: u32 = 0x04;
    /// Handshake interrupt sources, one per handshake cell
    pub const IRQ_HANDSHAKE_MASK: u32 = 0x0000_FFFF;
    pub const IRQ_GLOBAL_ENABLE: u32 = 0x8000_0000;

    /// Start of the DMA channel configuration registers
    pub const DMA_CHANNELS: u32 = 0x40;
    pub const DMA_CHANNEL_SIZE: u32 = 0x10;
    pub const DMA_CHANNEL_COUNT: usize = 8;
    pub const DMA_BASE_LOW: u32 = 0x00;
    pub const DMA_BASE_HIGH: u32 = 0x04;
    pub const DMA_BUFFER_SIZE: u32 = 0x08;
    pub const DMA_CONTROL: u32 = 0x0C;
    pub const DMA_CONTROL_ENABLE: u32 = 0x01;
    pub const DMA_CONTROL_HOST_TO_DEVICE: u32 = 0x02;
}

/// Magic value written to the system channel's command COS word to request a
/// reset
pub const RESET_COOKIE: u32 = 0x55AA_55AA;
/// Reset mode bits in the system control word
pub const RESET_MODE_MASK: u32 = 0x0F;
/// Reset parameter bits in the system control word
pub const RESET_PARAM_SHIFT: u32 = 4;
pub const RESET_PARAM_MASK: u32 = 0xF0;

// Handshake bit numbers.  Host and device use the same bit number for the two
// halves of a pair.

/// System channel: host reset request / device ready.  Communication
/// channel: host ready / device communicating.
pub const READY_BIT: u8 = 0;
/// Device error flag
pub const ERROR_BIT: u8 = 1;
/// Host COS command (host) / acknowledge (device)
pub const HOST_COS_BIT: u8 = 2;
/// Device COS command (device) / acknowledge (host)
pub const NETX_COS_BIT: u8 = 3;
/// Send mailbox command (host) / acknowledge (device)
pub const SEND_MBX_BIT: u8 = 4;
/// Receive mailbox command (device) / acknowledge (host)
pub const RECV_MBX_BIT: u8 = 5;
/// Process data area 0, output
pub const PD0_OUT_BIT: u8 = 6;
/// Process data area 0, input
pub const PD0_IN_BIT: u8 = 7;
/// Process data area 1, output
pub const PD1_OUT_BIT: u8 = 8;
/// Process data area 1, input
pub const PD1_IN_BIT: u8 = 9;

/// Mask for a handshake bit number
pub const fn bit_mask(bit: u8) -> u16 {
    1 << bit
}

bitflags! {
    /// Host flags of the system channel
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct HostSysFlags: u16 {
        const RESET         = 1 << READY_BIT;
        const BOOTSTART     = 1 << ERROR_BIT;
        const HOST_COS_CMD  = 1 << HOST_COS_BIT;
        const NETX_COS_ACK  = 1 << NETX_COS_BIT;
        const SEND_MBX_CMD  = 1 << SEND_MBX_BIT;
        const RECV_MBX_ACK  = 1 << RECV_MBX_BIT;
    }
}

bitflags! {
    /// Device flags of the system channel
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NetxSysFlags: u16 {
        const READY         = 1 << READY_BIT;
        const ERROR         = 1 << ERROR_BIT;
        const HOST_COS_ACK  = 1 << HOST_COS_BIT;
        const NETX_COS_CMD  = 1 << NETX_COS_BIT;
        const SEND_MBX_ACK  = 1 << SEND_MBX_BIT;
        const RECV_MBX_CMD  = 1 << RECV_MBX_BIT;
    }
}

bitflags! {
    /// Host flags of a communication channel
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct HostCommFlags: u16 {
        const HOST_READY    = 1 << READY_BIT;
        const HOST_COS_CMD  = 1 << HOST_COS_BIT;
        const NETX_COS_ACK  = 1 << NETX_COS_BIT;
        const SEND_MBX_CMD  = 1 << SEND_MBX_BIT;
        const RECV_MBX_ACK  = 1 << RECV_MBX_BIT;
        const PD0_OUT_CMD   = 1 << PD0_OUT_BIT;
        const PD0_IN_ACK    = 1 << PD0_IN_BIT;
        const PD1_OUT_CMD   = 1 << PD1_OUT_BIT;
        const PD1_IN_ACK    = 1 << PD1_IN_BIT;
    }
}

bitflags! {
    /// Device flags of a communication channel
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NetxCommFlags: u16 {
        const COMMUNICATING = 1 << READY_BIT;
        const ERROR         = 1 << ERROR_BIT;
        const HOST_COS_ACK  = 1 << HOST_COS_BIT;
        const NETX_COS_CMD  = 1 << NETX_COS_BIT;
        const SEND_MBX_ACK  = 1 << SEND_MBX_BIT;
        const RECV_MBX_CMD  = 1 << RECV_MBX_BIT;
        const PD0_OUT_ACK   = 1 << PD0_OUT_BIT;
        const PD0_IN_CMD    = 1 << PD0_IN_BIT;
        const PD1_OUT_ACK   = 1 << PD1_OUT_BIT;
        const PD1_IN_CMD    = 1 << PD1_IN_BIT;
    }
}

bitflags! {
    /// Application COS flags, written by the host into a communication
    /// channel's control block
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct AppCos: u32 {
        const APPLICATION_READY         = 0x0000_0001;
        const BUS_ON                    = 0x0000_0002;
        const BUS_ON_ENABLE             = 0x0000_0004;
        const INITIALIZATION            = 0x0000_0008;
        const INITIALIZATION_ENABLE     = 0x0000_0010;
        const LOCK_CONFIGURATION        = 0x0000_0020;
        const LOCK_CONFIGURATION_ENABLE = 0x0000_0040;
        const DMA                       = 0x0000_0080;
        const DMA_ENABLE                = 0x0000_0100;
    }
}

bitflags! {
    /// Communication COS flags, written by the device into a communication
    /// channel's common status block
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct CommCos: u32 {
        const READY                     = 0x0000_0001;
        const RUN                       = 0x0000_0002;
        const BUS_ON                    = 0x0000_0004;
        const CONFIG_LOCKED             = 0x0000_0008;
        const CONFIG_NEW                = 0x0000_0010;
        const RESTART_REQUIRED          = 0x0000_0020;
        const RESTART_REQUIRED_ENABLE   = 0x0000_0040;
        const DMA                       = 0x0000_0080;
    }
}

/// Reset flavours
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Restart the active firmware
    ColdStart = 2,
    /// Restart into the bootloader
    BootStart = 3,
    /// Restart and let the firmware apply a pending update, which ends in a
    /// second, internal reset
    UpdateStart = 4,
}

/// Width of a channel's handshake flags words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeWidth {
    Bits8,
    Bits16,
}

impl HandshakeWidth {
    /// Decode the size nibble of a channel info block.  Anything other than
    /// the 16-bit marker is treated as 8 bit.
    pub fn from_info(size_position: u8) -> Self {
        if size_position & channel_info::HANDSHAKE_SIZE_MASK == channel_info::HANDSHAKE_SIZE_16BIT
        {
            HandshakeWidth::Bits16
        } else {
            HandshakeWidth::Bits8
        }
    }

    /// Offset of the device flags within the cell
    pub const fn netx_offset(self) -> u32 {
        match self {
            HandshakeWidth::Bits8 => 2,
            HandshakeWidth::Bits16 => 0,
        }
    }

    /// Offset of the host flags within the cell
    pub const fn host_offset(self) -> u32 {
        match self {
            HandshakeWidth::Bits8 => 3,
            HandshakeWidth::Bits16 => 2,
        }
    }

    /// Extract the device flags from a raw cell value
    pub const fn netx_from_cell(self, cell: u32) -> u16 {
        match self {
            HandshakeWidth::Bits8 => ((cell >> 16) & 0xFF) as u16,
            HandshakeWidth::Bits16 => (cell & 0xFFFF) as u16,
        }
    }

    /// Extract the host flags from a raw cell value
    pub const fn host_from_cell(self, cell: u32) -> u16 {
        match self {
            HandshakeWidth::Bits8 => ((cell >> 24) & 0xFF) as u16,
            HandshakeWidth::Bits16 => (cell >> 16) as u16,
        }
    }
}

/// Channel type from a channel info block
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Undefined = 0,
    NotAvailable = 1,
    Reserved = 2,
    System = 3,
    Handshake = 4,
    Communication = 5,
    Application = 6,
}

impl From<u8> for ChannelType {
    fn from(value: u8) -> Self {
        match value {
            1 => ChannelType::NotAvailable,
            2 => ChannelType::Reserved,
            3 => ChannelType::System,
            4 => ChannelType::Handshake,
            5 => ChannelType::Communication,
            6 => ChannelType::Application,
            _ => ChannelType::Undefined,
        }
    }
}

// Little-endian field helpers over byte buffers

pub(crate) fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn put_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// System information block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub cookie: [u8; 4],
    pub dpm_total_size: u32,
    pub device_number: u32,
    pub serial_number: u32,
    pub hw_options: [u16; 4],
    pub manufacturer: u16,
    pub production_date: u16,
    pub license_flags_1: u32,
    pub license_flags_2: u32,
    pub license_id: u16,
    pub license_flags: u16,
    pub device_class: u16,
    pub hw_revision: u8,
    pub hw_compatibility: u8,
    pub dev_id_number: u8,
}

impl SystemInfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        use system_info::*;

        if buf.len() < SIZE {
            return Err(Error::InvalidBufferSize);
        }
        let mut cookie = [0u8; 4];
        cookie.copy_from_slice(&buf[COOKIE..COOKIE + 4]);
        let mut hw_options = [0u16; 4];
        for (ii, option) in hw_options.iter_mut().enumerate() {
            *option = le_u16(buf, HW_OPTIONS + ii * 2);
        }
        Ok(Self {
            cookie,
            dpm_total_size: le_u32(buf, DPM_TOTAL_SIZE),
            device_number: le_u32(buf, DEVICE_NUMBER),
            serial_number: le_u32(buf, SERIAL_NUMBER),
            hw_options,
            manufacturer: le_u16(buf, MANUFACTURER),
            production_date: le_u16(buf, PRODUCTION_DATE),
            license_flags_1: le_u32(buf, LICENSE_FLAGS_1),
            license_flags_2: le_u32(buf, LICENSE_FLAGS_2),
            license_id: le_u16(buf, LICENSE_ID),
            license_flags: le_u16(buf, LICENSE_FLAGS),
            device_class: le_u16(buf, DEVICE_CLASS),
            hw_revision: buf[HW_REVISION],
            hw_compatibility: buf[HW_COMPATIBILITY],
            dev_id_number: buf[DEV_ID_NUMBER],
        })
    }

    pub fn is_bootloader(&self) -> bool {
        self.cookie == COOKIE_BOOTLOADER
    }

    pub fn is_firmware(&self) -> bool {
        self.cookie == COOKIE_FIRMWARE
    }
}

/// Channel information block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_type: ChannelType,
    pub channel_id: u8,
    pub handshake_width: HandshakeWidth,
    pub number_of_blocks: u8,
    pub channel_size: u32,
    pub communication_class: u16,
    pub protocol_class: u16,
    pub conformance_class: u16,
    pub mailbox_size: u16,
}

impl ChannelInfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        use channel_info::*;

        if buf.len() < SIZE {
            return Err(Error::InvalidBufferSize);
        }
        Ok(Self {
            channel_type: ChannelType::from(buf[CHANNEL_TYPE]),
            channel_id: buf[CHANNEL_ID],
            handshake_width: HandshakeWidth::from_info(buf[HANDSHAKE_SIZE_POSITION]),
            number_of_blocks: buf[NUMBER_OF_BLOCKS],
            channel_size: le_u32(buf, CHANNEL_SIZE),
            communication_class: le_u16(buf, COMMUNICATION_CLASS),
            protocol_class: le_u16(buf, PROTOCOL_CLASS),
            conformance_class: le_u16(buf, CONFORMANCE_CLASS),
            mailbox_size: le_u16(buf, MAILBOX_SIZE),
        })
    }
}

/// Common status block of a communication channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonStatus {
    pub communication_cos: u32,
    pub communication_state: u32,
    pub communication_error: u32,
    pub version: u16,
    pub watchdog_time: u16,
    pub pd_in_handshake_mode: u8,
    pub pd_in_source: u8,
    pub pd_out_handshake_mode: u8,
    pub pd_out_source: u8,
    pub host_watchdog: u32,
    pub error_count: u32,
}

impl CommonStatus {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        use common_status::*;

        if buf.len() < SIZE {
            return Err(Error::InvalidBufferSize);
        }
        Ok(Self {
            communication_cos: le_u32(buf, COMMUNICATION_COS),
            communication_state: le_u32(buf, COMMUNICATION_STATE),
            communication_error: le_u32(buf, COMMUNICATION_ERROR),
            version: le_u16(buf, VERSION),
            watchdog_time: le_u16(buf, WATCHDOG_TIME),
            pd_in_handshake_mode: buf[PD_IN_HANDSHAKE_MODE],
            pd_in_source: buf[PD_IN_SOURCE],
            pd_out_handshake_mode: buf[PD_OUT_HANDSHAKE_MODE],
            pd_out_source: buf[PD_OUT_SOURCE],
            host_watchdog: le_u32(buf, HOST_WATCHDOG),
            error_count: le_u32(buf, ERROR_COUNT),
        })
    }

    pub fn cos(&self) -> CommCos {
        CommCos::from_bits_retain(self.communication_cos)
    }
}

/// Exception information left by the device's CPU after a fatal error.  The
/// register set depends on the CPU core, selected by the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInfo {
    /// No exception recorded
    None,
    /// ARM9 core
    Arm9 {
        cpsr: u32,
        spsr: u32,
        pc: u32,
        lr: u32,
        sp: u32,
        fault_address: u32,
        fault_status: u32,
    },
    /// Cortex-M core
    CortexM {
        xpsr: u32,
        pc: u32,
        lr: u32,
        sp: u32,
        cfsr: u32,
        hfsr: u32,
        mmfar: u32,
        bfar: u32,
    },
    /// Discriminant not recognised
    Unknown(u32),
}

impl ExceptionInfo {
    const CORE_NONE: u32 = 0;
    const CORE_ARM9: u32 = 1;
    const CORE_CORTEX_M: u32 = 2;

    pub fn decode(words: &[u32; system_status::EXCEPTION_INFO_WORDS]) -> Self {
        let r = &words[1..];
        match words[0] {
            Self::CORE_NONE => ExceptionInfo::None,
            Self::CORE_ARM9 => ExceptionInfo::Arm9 {
                cpsr: r[0],
                spsr: r[1],
                pc: r[2],
                lr: r[3],
                sp: r[4],
                fault_address: r[5],
                fault_status: r[6],
            },
            Self::CORE_CORTEX_M => ExceptionInfo::CortexM {
                xpsr: r[0],
                pc: r[1],
                lr: r[2],
                sp: r[3],
                cfsr: r[4],
                hfsr: r[5],
                mmfar: r[6],
                bfar: r[7],
            },
            other => ExceptionInfo::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_extraction_8bit() {
        // netx flags at byte 2, host flags at byte 3
        let cell = u32::from_le_bytes([0xAA, 0xBB, 0x21, 0x14]);
        assert_eq!(HandshakeWidth::Bits8.netx_from_cell(cell), 0x21);
        assert_eq!(HandshakeWidth::Bits8.host_from_cell(cell), 0x14);
    }

    #[test]
    fn test_cell_extraction_16bit() {
        let cell = u32::from_le_bytes([0x81, 0x02, 0x34, 0x01]);
        assert_eq!(HandshakeWidth::Bits16.netx_from_cell(cell), 0x0281);
        assert_eq!(HandshakeWidth::Bits16.host_from_cell(cell), 0x0134);
    }

    #[test]
    fn test_handshake_width_from_info() {
        assert_eq!(HandshakeWidth::from_info(0x20), HandshakeWidth::Bits16);
        assert_eq!(HandshakeWidth::from_info(0x21), HandshakeWidth::Bits16);
        assert_eq!(HandshakeWidth::from_info(0x10), HandshakeWidth::Bits8);
        assert_eq!(HandshakeWidth::from_info(0x00), HandshakeWidth::Bits8);
    }

    #[test]
    fn test_exception_info_variants() {
        let mut words = [0u32; system_status::EXCEPTION_INFO_WORDS];
        assert_eq!(ExceptionInfo::decode(&words), ExceptionInfo::None);

        words[0] = 2;
        words[2] = 0x0800_1234;
        words[5] = 0x0000_0100;
        match ExceptionInfo::decode(&words) {
            ExceptionInfo::CortexM { pc, cfsr, .. } => {
                assert_eq!(pc, 0x0800_1234);
                assert_eq!(cfsr, 0x100);
            }
            other => panic!("unexpected {other:?}"),
        }

        words[0] = 1;
        match ExceptionInfo::decode(&words) {
            ExceptionInfo::Arm9 { spsr, sp, .. } => {
                assert_eq!(spsr, 0x0800_1234);
                assert_eq!(sp, 0x100);
            }
            other => panic!("unexpected {other:?}"),
        }

        words[0] = 7;
        assert_eq!(ExceptionInfo::decode(&words), ExceptionInfo::Unknown(7));
    }

    #[test]
    fn test_channel_info_decode() {
        let mut buf = [0u8; channel_info::SIZE];
        buf[0] = 5;
        buf[1] = 0;
        buf[2] = 0x20;
        buf[3] = 8;
        buf[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        buf[10..12].copy_from_slice(&0x0050u16.to_le_bytes());
        buf[14..16].copy_from_slice(&0x0100u16.to_le_bytes());
        let info = ChannelInfo::decode(&buf).unwrap();
        assert_eq!(info.channel_type, ChannelType::Communication);
        assert_eq!(info.handshake_width, HandshakeWidth::Bits16);
        assert_eq!(info.channel_size, 0x1000);
        assert_eq!(info.protocol_class, 0x50);
        assert_eq!(info.mailbox_size, 0x100);
    }
}

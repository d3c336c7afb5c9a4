// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Numeric constants and wire structures of the Host-Firmware Interface.
//!
//! Every structure in this module is `#[repr(C)]`, without implicit padding, and is transferred
//! in little-endian order through the helpers of [`crate::io`].

use std::fmt;

use bitflags::bitflags;
use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Numeric band of packet types. A packet type belongs to the band if `begin <= type < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HfiRange {
    pub begin: u32,
    pub end: u32,
}

impl HfiRange {
    pub const fn contains(&self, packet_type: u32) -> bool {
        self.begin <= packet_type && packet_type < self.end
    }
}

pub const HFI_CMD_RANGE: HfiRange = HfiRange {
    begin: 0x0100_0000,
    end: 0x0200_0000,
};
pub const HFI_PROP_RANGE: HfiRange = HfiRange {
    begin: 0x0300_0000,
    end: 0x0400_0000,
};
pub const HFI_SESSION_ERROR_RANGE: HfiRange = HfiRange {
    begin: 0x0400_0000,
    end: 0x0500_0000,
};
pub const HFI_SYSTEM_ERROR_RANGE: HfiRange = HfiRange {
    begin: 0x0500_0000,
    end: 0x0600_0000,
};
pub const HFI_INFORMATION_RANGE: HfiRange = HfiRange {
    begin: 0x0600_0000,
    end: 0x0700_0000,
};

/// Command opcodes, used both for host commands and their firmware acknowledgements.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiCommand {
    Init = 0x0100_0001,
    PowerCollapse = 0x0100_0002,
    Open = 0x0100_0003,
    Close = 0x0100_0004,
    Start = 0x0100_0005,
    Stop = 0x0100_0006,
    Drain = 0x0100_0007,
    Resume = 0x0100_0008,
    Buffer = 0x0100_0009,
    DeliveryMode = 0x0100_000a,
    SubscribeMode = 0x0100_000b,
    SettingsChange = 0x0100_000c,
    Ssr = 0x0100_000d,
    Stability = 0x0100_000e,
}

/// Properties exchanged with the firmware.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiProperty {
    ImageVersion = 0x0300_0001,
    Codec = 0x0300_0100,
    BitstreamResolution = 0x0300_0103,
    CropOffsets = 0x0300_0105,
    Profile = 0x0300_0107,
    Level = 0x0300_0108,
    Tier = 0x0300_0109,
    LumaChromaBitDepth = 0x0300_010f,
    CodedFrames = 0x0300_0120,
    BufferFwMinOutputCount = 0x0300_0123,
    PicOrderCntType = 0x0300_0128,
    DpbList = 0x0300_0137,
    SignalColorInfo = 0x0300_0155,
    PictureType = 0x0300_0162,
    NoOutput = 0x0300_0168,
    SubframeInput = 0x0300_0169,
}

#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiSessionError {
    UnknownSession = 0x0400_0001,
    MaxSessions = 0x0400_0002,
    Fatal = 0x0400_0003,
    InvalidState = 0x0400_0004,
    InsufficientResources = 0x0400_0005,
    BufferNotSet = 0x0400_0006,
    StreamUnsupported = 0x0400_0007,
}

#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiSystemError {
    WatchdogTimeout = 0x0500_0001,
    Noc = 0x0500_0002,
    Fatal = 0x0500_0003,
}

#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiInformation {
    Unsupported = 0x0600_0001,
    DataCorrupt = 0x0600_0002,
    BufferOverflow = 0x0600_0003,
}

/// Type of the payload following a packet.
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiPayloadType {
    None = 0x0,
    U32 = 0x1,
    S32 = 0x2,
    U64 = 0x3,
    S64 = 0x4,
    Structure = 0x5,
    Blob = 0x6,
    String = 0x7,
    Q16 = 0x8,
    U32Enum = 0x9,
    Packed32 = 0xa,
    U32Array = 0xb,
    S32Array = 0xc,
    Packed64 = 0xd,
}

impl HfiPayloadType {
    /// Size in bytes of fixed-size payloads, `None` for variable-size ones.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            HfiPayloadType::None => Some(0),
            HfiPayloadType::U32
            | HfiPayloadType::S32
            | HfiPayloadType::Q16
            | HfiPayloadType::U32Enum
            | HfiPayloadType::Packed32 => Some(4),
            HfiPayloadType::U64 | HfiPayloadType::S64 | HfiPayloadType::Packed64 => Some(8),
            _ => None,
        }
    }
}

#[derive(PartialEq, Eq, N, Clone, Copy, Debug, Default)]
#[repr(u32)]
pub enum HfiPort {
    #[default]
    None = 0x0,
    Bitstream = 0x1,
    Raw = 0x2,
}

#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiBufferType {
    Bitstream = 0x1,
    Raw = 0x2,
    Metadata = 0x3,
    Subcache = 0x4,
    PartialData = 0x5,
    Dpb = 0x6,
    Bin = 0x7,
    Line = 0x8,
    Arp = 0x9,
    Comv = 0xa,
    NonComv = 0xb,
    Persist = 0xc,
    Vpss = 0xd,
}

/// Queue identifiers, which are also the queue `type` field of the queue headers.
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum HfiQueueType {
    Command = 0,
    Message = 1,
    Debug = 2,
}

bitflags! {
    /// Flags set by the host on the packets it sends.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u32 {
        const INTR_REQUIRED = 0x0000_0001;
        const RESPONSE_REQUIRED = 0x0000_0002;
        const NON_DISCARDABLE = 0x0000_0004;
        const GET_PROPERTY = 0x0000_0008;
    }
}

bitflags! {
    /// Flags set by the firmware on response packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FwFlags: u32 {
        const SUCCESS = 0x0000_0001;
        const INFORMATION = 0x0000_0002;
        const SESSION_ERROR = 0x0000_0004;
        const SYSTEM_ERROR = 0x0000_0008;
    }
}

bitflags! {
    /// Flags of the `flags` member of [`HfiBuffer`]. Host and firmware share the low bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HfiBufferFlags: u32 {
        const RELEASE = 0x0000_0001;
        const READ_ONLY = 0x0000_0010;
        const CODEC_CONFIG = 0x0000_0100;
        const LAST = 0x1000_0000;
        const PSC_LAST = 0x2000_0000;
    }
}

impl HfiBufferFlags {
    /// Firmware-side name of `RELEASE` on responses.
    pub const RELEASE_DONE: HfiBufferFlags = HfiBufferFlags::RELEASE;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HfiPictureType: u32 {
        const IDR = 0x0000_0001;
        const P = 0x0000_0002;
        const B = 0x0000_0004;
        const I = 0x0000_0008;
        const CRA = 0x0000_0010;
        const BLA = 0x0000_0020;
    }
}

pub const HFI_MODE_PORT_SETTINGS_CHANGE: u32 = 0x1;
pub const HFI_MODE_PROPERTY: u32 = 0x2;
pub const HFI_MODE_METADATA: u32 = 0x4;

/// Header starting every command and response.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiHeader {
    /// Size of the header and all its packets, in bytes.
    pub size: u32,
    pub session_id: u32,
    pub header_id: u32,
    pub reserved: [u32; 4],
    pub num_packets: u32,
}

/// Header of one packet inside a [`HfiHeader`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiPacket {
    /// Size of the packet and its payload, in bytes.
    pub size: u32,
    pub packet_type: u32,
    pub flags: u32,
    pub payload_info: u32,
    pub port: u32,
    pub packet_id: u32,
    pub reserved: [u32; 2],
}

impl HfiPacket {
    pub fn fw_flags(&self) -> FwFlags {
        FwFlags::from_bits_retain(self.flags)
    }
}

/// Buffer descriptor carried as the payload of `HfiCommand::Buffer` packets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiBuffer {
    pub buffer_type: u32,
    pub index: u32,
    pub base_address: u64,
    pub addr_offset: u32,
    pub buffer_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub timestamp: u64,
    pub flags: u32,
    pub reserved: [u32; 5],
}

impl HfiBuffer {
    pub fn buffer_flags(&self) -> HfiBufferFlags {
        HfiBufferFlags::from_bits_retain(self.flags)
    }
}

pub const HFI_HEADER_SIZE: usize = std::mem::size_of::<HfiHeader>();
pub const HFI_PACKET_SIZE: usize = std::mem::size_of::<HfiPacket>();
pub const HFI_BUFFER_SIZE: usize = std::mem::size_of::<HfiBuffer>();

/// Human-readable name of a packet type, for logging.
pub struct PacketTypeName(pub u32);

impl fmt::Display for PacketTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cmd) = HfiCommand::n(self.0) {
            write!(f, "{:?}", cmd)
        } else if let Some(prop) = HfiProperty::n(self.0) {
            write!(f, "{:?}", prop)
        } else if let Some(err) = HfiSessionError::n(self.0) {
            write!(f, "SessionError::{:?}", err)
        } else if let Some(err) = HfiSystemError::n(self.0) {
            write!(f, "SystemError::{:?}", err)
        } else if let Some(info) = HfiInformation::n(self.0) {
            write!(f, "Information::{:?}", info)
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

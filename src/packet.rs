// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Building of host commands and decoding of firmware responses.
//!
//! Commands are built with [`CommandBuilder`], which emits a [`HfiHeader`] followed by any number
//! of packets. Responses are validated and split into their packets by [`parse_response`], after
//! which the payload of each packet can be interpreted through the accessors of
//! [`ResponsePacket`].

use std::fmt::Write as _;

use log::debug;
use thiserror::Error;

use crate::io::ReadFromHfi;
use crate::io::WriteToHfi;
use crate::protocol::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("command of {needed} bytes exceeds the maximum of {max}")]
    TooLarge { needed: usize, max: usize },
    #[error("error while serializing packet: {0}")]
    Io(std::io::ErrorKind),
    #[error("response of {0} bytes is smaller than its header")]
    Truncated(usize),
    #[error("response header claims {size} bytes but {available} are available")]
    SizeMismatch { size: usize, available: usize },
    #[error("packet {index} has invalid size {size}")]
    InvalidPacketSize { index: u32, size: u32 },
    #[error("packet {index} overruns the response")]
    PacketOverrun { index: u32 },
    #[error("invalid payload for packet {0:#010x}")]
    InvalidPayload(u32),
}

/// Source of the monotonically increasing header and packet identifiers.
#[derive(Debug, Default)]
pub struct PacketIds {
    header_id: u32,
    packet_id: u32,
}

impl PacketIds {
    fn next_header_id(&mut self) -> u32 {
        let id = self.header_id;
        self.header_id = self.header_id.wrapping_add(1);
        id
    }

    fn next_packet_id(&mut self) -> u32 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }
}

/// Payload attached to a command packet.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    None,
    U32(u32),
    U32Enum(u32),
    U64(u64),
    U32Array(&'a [u32]),
    Buffer(HfiBuffer),
}

impl Payload<'_> {
    fn payload_type(&self) -> HfiPayloadType {
        match self {
            Payload::None => HfiPayloadType::None,
            Payload::U32(_) => HfiPayloadType::U32,
            Payload::U32Enum(_) => HfiPayloadType::U32Enum,
            Payload::U64(_) => HfiPayloadType::U64,
            Payload::U32Array(_) => HfiPayloadType::U32Array,
            Payload::Buffer(_) => HfiPayloadType::Structure,
        }
    }

    fn size(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::U32(_) | Payload::U32Enum(_) => 4,
            Payload::U64(_) => 8,
            Payload::U32Array(a) => a.len() * 4,
            Payload::Buffer(_) => HFI_BUFFER_SIZE,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        match *self {
            Payload::None => Ok(()),
            Payload::U32(v) | Payload::U32Enum(v) => buf.write_obj(v),
            Payload::U64(v) => buf.write_obj(v),
            Payload::U32Array(a) => a.iter().try_for_each(|v| buf.write_obj(*v)),
            Payload::Buffer(b) => buf.write_obj(b),
        }
    }
}

/// Incrementally builds one command: a header followed by its packets.
pub struct CommandBuilder<'a> {
    ids: &'a mut PacketIds,
    header: HfiHeader,
    buf: Vec<u8>,
    max_size: usize,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(ids: &'a mut PacketIds, session_id: u32, max_size: usize) -> Self {
        let header = HfiHeader {
            session_id,
            header_id: ids.next_header_id(),
            ..Default::default()
        };
        Self {
            ids,
            header,
            buf: vec![0u8; HFI_HEADER_SIZE],
            max_size,
        }
    }

    /// Append a packet of `packet_type` carrying `payload`.
    pub fn packet(
        &mut self,
        packet_type: u32,
        flags: HostFlags,
        port: HfiPort,
        payload: Payload,
    ) -> Result<&mut Self, PacketError> {
        let size = HFI_PACKET_SIZE + payload.size();
        if self.buf.len() + size > self.max_size {
            return Err(PacketError::TooLarge {
                needed: self.buf.len() + size,
                max: self.max_size,
            });
        }

        let packet = HfiPacket {
            size: size as u32,
            packet_type,
            flags: flags.bits(),
            payload_info: payload.payload_type() as u32,
            port: port as u32,
            packet_id: self.ids.next_packet_id(),
            reserved: [0; 2],
        };
        self.buf
            .write_obj(packet)
            .and_then(|()| payload.write_to(&mut self.buf))
            .map_err(|e| PacketError::Io(e.kind()))?;
        self.header.num_packets += 1;

        Ok(self)
    }

    /// Finalize the header and return the encoded command.
    pub fn finish(mut self) -> Result<Vec<u8>, PacketError> {
        self.header.size = self.buf.len() as u32;
        (&mut self.buf[..HFI_HEADER_SIZE])
            .write_obj(self.header)
            .map_err(|e| PacketError::Io(e.kind()))?;
        Ok(self.buf)
    }
}

fn command_flags(cmd: HfiCommand) -> HostFlags {
    let flags = HostFlags::RESPONSE_REQUIRED | HostFlags::INTR_REQUIRED;
    match cmd {
        HfiCommand::Close | HfiCommand::Stop => flags | HostFlags::NON_DISCARDABLE,
        _ => flags,
    }
}

/// System initialization command.
pub fn sys_init(ids: &mut PacketIds, max_size: usize) -> Result<Vec<u8>, PacketError> {
    let mut builder = CommandBuilder::new(ids, 0, max_size);
    builder.packet(
        HfiCommand::Init as u32,
        command_flags(HfiCommand::Init),
        HfiPort::None,
        Payload::None,
    )?;
    builder.finish()
}

/// Query of the firmware image version.
pub fn sys_image_version(ids: &mut PacketIds, max_size: usize) -> Result<Vec<u8>, PacketError> {
    let mut builder = CommandBuilder::new(ids, 0, max_size);
    builder.packet(
        HfiProperty::ImageVersion as u32,
        HostFlags::INTR_REQUIRED | HostFlags::GET_PROPERTY,
        HfiPort::None,
        Payload::None,
    )?;
    builder.finish()
}

/// A session command such as `Open`, `Start` or `Stop`.
pub fn session_command(
    ids: &mut PacketIds,
    max_size: usize,
    session_id: u32,
    cmd: HfiCommand,
    port: HfiPort,
    payload: Payload,
) -> Result<Vec<u8>, PacketError> {
    let mut builder = CommandBuilder::new(ids, session_id, max_size);
    builder.packet(cmd as u32, command_flags(cmd), port, payload)?;
    builder.finish()
}

/// Set one session property.
pub fn session_property(
    ids: &mut PacketIds,
    max_size: usize,
    session_id: u32,
    property: HfiProperty,
    port: HfiPort,
    payload: Payload,
) -> Result<Vec<u8>, PacketError> {
    let mut builder = CommandBuilder::new(ids, session_id, max_size);
    builder.packet(property as u32, HostFlags::empty(), port, payload)?;
    builder.finish()
}

/// Subscribe to the port settings change of `port`, reporting the listed `properties`.
pub fn subscribe_psc(
    ids: &mut PacketIds,
    max_size: usize,
    session_id: u32,
    port: HfiPort,
    properties: &[HfiProperty],
) -> Result<Vec<u8>, PacketError> {
    let payload: Vec<u32> = std::iter::once(HFI_MODE_PORT_SETTINGS_CHANGE)
        .chain(properties.iter().map(|p| *p as u32))
        .collect();
    session_command(
        ids,
        max_size,
        session_id,
        HfiCommand::SubscribeMode,
        port,
        Payload::U32Array(&payload),
    )
}

/// Queue `buffer` and its optional metadata buffer in a single command.
pub fn queue_buffer(
    ids: &mut PacketIds,
    max_size: usize,
    session_id: u32,
    port: HfiPort,
    buffer: HfiBuffer,
    meta: Option<HfiBuffer>,
) -> Result<Vec<u8>, PacketError> {
    let mut builder = CommandBuilder::new(ids, session_id, max_size);
    builder.packet(
        HfiCommand::Buffer as u32,
        HostFlags::INTR_REQUIRED,
        port,
        Payload::Buffer(buffer),
    )?;
    if let Some(meta) = meta {
        builder.packet(
            HfiCommand::Buffer as u32,
            HostFlags::empty(),
            port,
            Payload::Buffer(meta),
        )?;
    }
    builder.finish()
}

/// Ask the firmware to give back `buffer`.
pub fn release_buffer(
    ids: &mut PacketIds,
    max_size: usize,
    session_id: u32,
    port: HfiPort,
    mut buffer: HfiBuffer,
) -> Result<Vec<u8>, PacketError> {
    buffer.flags |= HfiBufferFlags::RELEASE.bits();
    let mut builder = CommandBuilder::new(ids, session_id, max_size);
    builder.packet(
        HfiCommand::Buffer as u32,
        HostFlags::INTR_REQUIRED | HostFlags::RESPONSE_REQUIRED,
        port,
        Payload::Buffer(buffer),
    )?;
    builder.finish()
}

/// One packet of a response, with its payload.
#[derive(Debug, Clone, Copy)]
pub struct ResponsePacket<'a> {
    pub packet: HfiPacket,
    pub payload: &'a [u8],
}

impl ResponsePacket<'_> {
    pub fn packet_type(&self) -> u32 {
        self.packet.packet_type
    }

    pub fn flags(&self) -> FwFlags {
        self.packet.fw_flags()
    }

    pub fn port(&self) -> Option<HfiPort> {
        HfiPort::n(self.packet.port)
    }

    pub fn payload_type(&self) -> Option<HfiPayloadType> {
        HfiPayloadType::n(self.packet.payload_info)
    }

    /// Returns the `index`th 32-bit word of the payload.
    pub fn u32_at(&self, index: usize) -> Option<u32> {
        let mut bytes = self.payload.get(index * 4..(index + 1) * 4)?;
        bytes.read_obj::<u32>().ok()
    }

    /// Returns the payload as a list of 32-bit words.
    pub fn u32_array(&self) -> Vec<u32> {
        (0..self.payload.len() / 4)
            .filter_map(|i| self.u32_at(i))
            .collect()
    }

    /// Returns the buffer descriptor carried by a `HfiCommand::Buffer` packet.
    pub fn buffer(&self) -> Result<HfiBuffer, PacketError> {
        if self.payload_type() != Some(HfiPayloadType::Structure)
            || self.payload.len() < HFI_BUFFER_SIZE
        {
            return Err(PacketError::InvalidPayload(self.packet.packet_type));
        }
        let mut payload = self.payload;
        payload
            .read_obj()
            .map_err(|_| PacketError::InvalidPayload(self.packet.packet_type))
    }

    /// Returns the payload as a string, with NULs replaced by spaces.
    pub fn string(&self) -> String {
        let s: String = self
            .payload
            .iter()
            .map(|&b| if b == 0 { ' ' } else { b as char })
            .collect();
        s.trim_end().to_string()
    }

    /// Whether the payload is large enough for its declared type.
    pub fn has_valid_payload(&self) -> bool {
        let Some(payload_type) = self.payload_type() else {
            return false;
        };
        let needed = match payload_type {
            HfiPayloadType::None => return false,
            HfiPayloadType::Structure if self.packet_type() == HfiCommand::Buffer as u32 => {
                HFI_BUFFER_SIZE
            }
            t => t.fixed_size().unwrap_or(1),
        };
        self.payload.len() >= needed
    }
}

/// A response from the firmware, split into its packets.
#[derive(Debug)]
pub struct Response<'a> {
    pub header: HfiHeader,
    pub packets: Vec<ResponsePacket<'a>>,
}

/// Validate the response contained in `bytes` and split it into its packets.
///
/// Every packet must have a non-zero size covering at least its header and must stay within the
/// size advertised by the response header.
pub fn parse_response(bytes: &[u8]) -> Result<Response<'_>, PacketError> {
    let mut reader = bytes;
    let header: HfiHeader = reader
        .read_obj()
        .map_err(|_| PacketError::Truncated(bytes.len()))?;

    let size = header.size as usize;
    if size < HFI_HEADER_SIZE {
        return Err(PacketError::Truncated(size));
    }
    if size > bytes.len() {
        return Err(PacketError::SizeMismatch {
            size,
            available: bytes.len(),
        });
    }
    if header.num_packets > 0 && size < HFI_HEADER_SIZE + HFI_PACKET_SIZE {
        return Err(PacketError::PacketOverrun { index: 0 });
    }

    let mut offset = HFI_HEADER_SIZE;
    let mut packets = Vec::with_capacity(header.num_packets as usize);
    for index in 0..header.num_packets {
        if offset + HFI_PACKET_SIZE > size {
            return Err(PacketError::PacketOverrun { index });
        }
        let mut reader = &bytes[offset..size];
        let packet: HfiPacket = reader
            .read_obj()
            .map_err(|_| PacketError::PacketOverrun { index })?;

        let packet_size = packet.size as usize;
        if packet_size < HFI_PACKET_SIZE {
            return Err(PacketError::InvalidPacketSize {
                index,
                size: packet.size,
            });
        }
        if offset + packet_size > size {
            return Err(PacketError::PacketOverrun { index });
        }

        packets.push(ResponsePacket {
            packet,
            payload: &bytes[offset + HFI_PACKET_SIZE..offset + packet_size],
        });
        offset += packet_size;
    }

    Ok(Response { header, packets })
}

/// Hexadecimal dump of `bytes` by 32-bit words, for debug logs.
pub fn dump(prefix: &str, bytes: &[u8]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    for (line, chunk) in bytes.chunks(32).enumerate() {
        let mut text = String::new();
        for word in chunk.chunks(4) {
            let mut w = [0u8; 4];
            w[..word.len()].copy_from_slice(word);
            let _ = write!(text, " {:08x}", u32::from_le_bytes(w));
        }
        debug!("{} {:04x}:{}", prefix, line * 32, text);
    }
}

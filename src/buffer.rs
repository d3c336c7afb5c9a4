// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer bookkeeping of a session.
//!
//! Every buffer known to a session lives in the [`BufferCollection`] of its type. Client buffers
//! are created the first time they are queued and removed once they have been returned to the
//! client. Internal buffers are allocated by the driver for the firmware and live until the
//! firmware acknowledges their release.
//!
//! Decoder output buffers returned by the firmware with the read-only flag are still used as
//! references by the firmware. They are kept in the [`BufferState::Retained`] state and their
//! identity is recorded in the read-only list until the firmware returns them again without
//! that flag, or acknowledges their release.

use bitflags::bitflags;
use thiserror::Error;

use crate::mapping::MappingError;
use crate::mapping::MemoryHandle;
use crate::protocol::HfiBuffer;
use crate::protocol::HfiBufferFlags;
use crate::protocol::HfiBufferType;
use crate::protocol::HfiPictureType;
use crate::protocol::HfiPort;
use crate::session::Codec;
use crate::session::Domain;

/// Driver-side type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Input,
    Output,
    InputMeta,
    OutputMeta,
    Bin,
    Arp,
    Comv,
    NonComv,
    Line,
    Dpb,
    Persist,
    Vpss,
}

impl BufferType {
    pub const ALL: [BufferType; 12] = [
        BufferType::Input,
        BufferType::Output,
        BufferType::InputMeta,
        BufferType::OutputMeta,
        BufferType::Bin,
        BufferType::Arp,
        BufferType::Comv,
        BufferType::NonComv,
        BufferType::Line,
        BufferType::Dpb,
        BufferType::Persist,
        BufferType::Vpss,
    ];

    /// Buffers allocated by the driver for the exclusive use of the firmware.
    pub fn is_internal(self) -> bool {
        !matches!(
            self,
            BufferType::Input | BufferType::Output | BufferType::InputMeta | BufferType::OutputMeta
        )
    }

    pub fn is_meta(self) -> bool {
        matches!(self, BufferType::InputMeta | BufferType::OutputMeta)
    }

    /// Metadata type accompanying data buffers of this type.
    pub fn meta_type(self) -> Option<BufferType> {
        match self {
            BufferType::Input => Some(BufferType::InputMeta),
            BufferType::Output => Some(BufferType::OutputMeta),
            _ => None,
        }
    }

    /// Internal buffers used on the input port of `domain`.
    pub fn input_internal(domain: Domain) -> &'static [BufferType] {
        match domain {
            Domain::Decoder => &[
                BufferType::Bin,
                BufferType::Comv,
                BufferType::NonComv,
                BufferType::Line,
                BufferType::Persist,
            ],
            Domain::Encoder => &[BufferType::Vpss],
        }
    }

    /// Internal buffers used on the output port of `domain`.
    pub fn output_internal(domain: Domain) -> &'static [BufferType] {
        match domain {
            Domain::Decoder => &[BufferType::Dpb],
            Domain::Encoder => &[
                BufferType::Bin,
                BufferType::Comv,
                BufferType::NonComv,
                BufferType::Line,
                BufferType::Arp,
                BufferType::Dpb,
            ],
        }
    }

    fn is_input_side(self, domain: Domain) -> bool {
        match self {
            BufferType::Input | BufferType::InputMeta => true,
            BufferType::Output | BufferType::OutputMeta => false,
            t => !BufferType::output_internal(domain).contains(&t),
        }
    }

    /// HFI port on which buffers of this type are exchanged.
    pub fn hfi_port(self, domain: Domain) -> HfiPort {
        match (domain, self.is_input_side(domain)) {
            (Domain::Decoder, true) | (Domain::Encoder, false) => HfiPort::Bitstream,
            (Domain::Decoder, false) | (Domain::Encoder, true) => HfiPort::Raw,
        }
    }

    /// HFI type of buffers of this type.
    pub fn hfi_type(self, domain: Domain) -> HfiBufferType {
        match self {
            BufferType::Input | BufferType::Output => match self.hfi_port(domain) {
                HfiPort::Raw => HfiBufferType::Raw,
                _ => HfiBufferType::Bitstream,
            },
            BufferType::InputMeta | BufferType::OutputMeta => HfiBufferType::Metadata,
            BufferType::Bin => HfiBufferType::Bin,
            BufferType::Arp => HfiBufferType::Arp,
            BufferType::Comv => HfiBufferType::Comv,
            BufferType::NonComv => HfiBufferType::NonComv,
            BufferType::Line => HfiBufferType::Line,
            BufferType::Dpb => HfiBufferType::Dpb,
            BufferType::Persist => HfiBufferType::Persist,
            BufferType::Vpss => HfiBufferType::Vpss,
        }
    }

    /// Driver type of a buffer reported by the firmware on `port`, if that combination is valid
    /// for `domain`.
    pub fn from_hfi(domain: Domain, port: HfiPort, hfi_type: HfiBufferType) -> Option<Self> {
        let t = match hfi_type {
            HfiBufferType::Metadata => match (domain, port) {
                (Domain::Decoder, HfiPort::Bitstream) | (Domain::Encoder, HfiPort::Raw) => {
                    BufferType::InputMeta
                }
                (Domain::Decoder, HfiPort::Raw) | (Domain::Encoder, HfiPort::Bitstream) => {
                    BufferType::OutputMeta
                }
                _ => return None,
            },
            HfiBufferType::Bitstream => match domain {
                Domain::Decoder => BufferType::Input,
                Domain::Encoder => BufferType::Output,
            },
            HfiBufferType::Raw => match domain {
                Domain::Decoder => BufferType::Output,
                Domain::Encoder => BufferType::Input,
            },
            HfiBufferType::Bin => BufferType::Bin,
            HfiBufferType::Arp => BufferType::Arp,
            HfiBufferType::Comv => BufferType::Comv,
            HfiBufferType::NonComv => BufferType::NonComv,
            HfiBufferType::Line => BufferType::Line,
            HfiBufferType::Dpb => BufferType::Dpb,
            HfiBufferType::Persist => BufferType::Persist,
            HfiBufferType::Vpss => BufferType::Vpss,
            HfiBufferType::Subcache | HfiBufferType::PartialData => return None,
        };

        let valid = match t {
            BufferType::InputMeta | BufferType::OutputMeta => true,
            t if t.is_internal() => {
                (BufferType::input_internal(domain).contains(&t)
                    || BufferType::output_internal(domain).contains(&t))
                    && t.hfi_port(domain) == port
            }
            t => t.hfi_port(domain) == port,
        };

        valid.then_some(t)
    }
}

bitflags! {
    /// Flags reported to the client along with a completed buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const KEYFRAME = 1 << 0;
        const PFRAME = 1 << 1;
        const BFRAME = 1 << 2;
        const ERROR = 1 << 3;
        const CODEC_CONFIG = 1 << 4;
        const LAST = 1 << 5;
    }
}

/// Ownership state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Known to the driver, not sent to the firmware yet.
    Deferred,
    /// Owned by the firmware.
    Queued,
    /// Returned by the firmware, waiting to be reported to the client.
    Dequeued,
    /// Returned by the firmware but still used as a read-only reference.
    Retained,
    /// Release requested from the firmware, waiting for its acknowledgement.
    PendingRelease,
}

/// Per-response information accumulated from properties and applied to completed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub picture_type: HfiPictureType,
    pub no_output: bool,
    pub subframe_input: bool,
    pub data_corrupt: bool,
    pub overflow: bool,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            picture_type: HfiPictureType::empty(),
            no_output: false,
            subframe_input: false,
            data_corrupt: false,
            overflow: false,
        }
    }
}

/// Translate firmware buffer flags and frame information into client flags.
pub fn driver_flags(codec: Codec, hfi_flags: HfiBufferFlags, frame: &FrameInfo) -> BufferFlags {
    let mut flags = BufferFlags::empty();

    let pic = frame.picture_type;
    if pic.intersects(HfiPictureType::IDR | HfiPictureType::CRA | HfiPictureType::BLA) {
        flags |= BufferFlags::KEYFRAME;
    }
    if pic.contains(HfiPictureType::P) {
        flags |= BufferFlags::PFRAME;
    }
    if pic.contains(HfiPictureType::B) {
        flags |= BufferFlags::BFRAME;
    }
    // Intra frames are only random access points for VP9.
    if pic.contains(HfiPictureType::I) && codec == Codec::Vp9 {
        flags |= BufferFlags::KEYFRAME;
    }
    if frame.data_corrupt || frame.overflow {
        flags |= BufferFlags::ERROR;
    }
    if hfi_flags.contains(HfiBufferFlags::CODEC_CONFIG) {
        flags |= BufferFlags::CODEC_CONFIG;
    }
    if hfi_flags.contains(HfiBufferFlags::LAST) {
        flags |= BufferFlags::LAST;
    }

    flags
}

/// Client-provided description of a buffer to queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub buffer_type: BufferType,
    pub index: u32,
    pub memory: MemoryHandle,
    pub buffer_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub timestamp: u64,
    pub flags: BufferFlags,
}

/// A buffer returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub buffer_type: BufferType,
    pub index: u32,
    pub memory: MemoryHandle,
    pub data_offset: u32,
    pub data_size: u32,
    pub timestamp: u64,
    pub flags: BufferFlags,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub buffer_type: BufferType,
    pub index: u32,
    pub memory: MemoryHandle,
    pub buffer_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub device_addr: u64,
    pub timestamp: u64,
    pub flags: BufferFlags,
    pub state: BufferState,
    /// The firmware may only read from this buffer.
    pub read_only: bool,
    /// The buffer has been reported to the client.
    pub done: bool,
}

impl Buffer {
    pub fn from_descriptor(desc: &BufferDescriptor) -> Self {
        Self {
            buffer_type: desc.buffer_type,
            index: desc.index,
            memory: desc.memory,
            buffer_size: desc.buffer_size,
            data_offset: desc.data_offset,
            data_size: desc.data_size,
            device_addr: 0,
            timestamp: desc.timestamp,
            flags: desc.flags,
            state: BufferState::Deferred,
            read_only: false,
            done: false,
        }
    }

    /// HFI descriptor used to queue or release this buffer.
    pub fn to_hfi(&self, domain: Domain) -> HfiBuffer {
        let mut flags = HfiBufferFlags::empty();
        if self.read_only {
            flags |= HfiBufferFlags::READ_ONLY;
        }
        if self.flags.contains(BufferFlags::CODEC_CONFIG) {
            flags |= HfiBufferFlags::CODEC_CONFIG;
        }

        HfiBuffer {
            buffer_type: self.buffer_type.hfi_type(domain) as u32,
            index: self.index,
            base_address: self.device_addr,
            addr_offset: 0,
            buffer_size: self.buffer_size,
            data_offset: self.data_offset,
            data_size: self.data_size,
            timestamp: self.timestamp,
            flags: flags.bits(),
            reserved: [0; 5],
        }
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            buffer_type: self.buffer_type,
            index: self.index,
            memory: self.memory,
            data_offset: self.data_offset,
            data_size: self.data_size,
            timestamp: self.timestamp,
            flags: self.flags,
            read_only: self.read_only,
        }
    }
}

/// All the buffers of one type, along with the firmware requirements for that type.
#[derive(Debug, Default)]
pub struct BufferCollection {
    pub list: Vec<Buffer>,
    pub min_count: u32,
    pub extra_count: u32,
    pub actual_count: u32,
    pub size: u32,
    /// Internal buffers of the previous stream are large enough to be used again.
    pub reuse: bool,
}

impl BufferCollection {
    /// Number of buffers currently owned by the firmware.
    pub fn queued_count(&self) -> usize {
        self.list
            .iter()
            .filter(|b| b.state == BufferState::Queued)
            .count()
    }

    pub fn position(&self, predicate: impl FnMut(&Buffer) -> bool) -> Option<usize> {
        self.list.iter().position(predicate)
    }

    /// Remove and return every buffer for which `predicate` returns `true`.
    pub fn drain_where(&mut self, mut predicate: impl FnMut(&Buffer) -> bool) -> Vec<Buffer> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.list.len() {
            if predicate(&self.list[i]) {
                removed.push(self.list.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }
}

/// Identity of a buffer held as a read-only reference by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyRef {
    pub memory: MemoryHandle,
    pub device_addr: u64,
    pub data_offset: u32,
    pub index: u32,
    pub buffer_size: u32,
    /// A release has been requested from the firmware.
    pub pending_release: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("{0:?} buffer {1} is already in use")]
    Duplicate(BufferType, u32),
    #[error("no {0:?} buffer found for index {1}")]
    MissingMeta(BufferType, u32),
    #[error("{0:?} buffers cannot be queued by clients")]
    NotClientType(BufferType),
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("failed to allocate internal buffer: {0}")]
    Allocation(i32),
}

/// Every buffer of a session.
#[derive(Debug, Default)]
pub struct SessionBuffers {
    collections: [BufferCollection; 12],
    /// Decoder output buffers still referenced by the firmware.
    pub read_only: Vec<ReadOnlyRef>,
    /// DPB list last reported by the firmware.
    pub dpb_list: Option<Vec<u32>>,
}

impl SessionBuffers {
    fn slot(t: BufferType) -> usize {
        BufferType::ALL.iter().position(|b| *b == t).unwrap_or(0)
    }

    pub fn get(&self, t: BufferType) -> &BufferCollection {
        &self.collections[Self::slot(t)]
    }

    pub fn get_mut(&mut self, t: BufferType) -> &mut BufferCollection {
        &mut self.collections[Self::slot(t)]
    }

    /// Position of the first read-only reference backed by `memory`, at any data offset.
    pub fn read_only_position(&self, memory: MemoryHandle) -> Option<usize> {
        self.read_only.iter().position(|r| r.memory == memory)
    }

    /// Record `buffer` as a read-only reference of the firmware, if it isn't already.
    pub fn add_read_only(&mut self, buffer: &Buffer) {
        if self
            .read_only
            .iter()
            .any(|r| r.device_addr == buffer.device_addr && r.data_offset == buffer.data_offset)
        {
            return;
        }
        self.read_only.push(ReadOnlyRef {
            memory: buffer.memory,
            device_addr: buffer.device_addr,
            data_offset: buffer.data_offset,
            index: buffer.index,
            buffer_size: buffer.buffer_size,
            pending_release: false,
        });
    }

    /// Forget the read-only reference at `device_addr` and `data_offset`. Returns it if it was
    /// present.
    pub fn remove_read_only(&mut self, device_addr: u64, data_offset: u32) -> Option<ReadOnlyRef> {
        let i = self
            .read_only
            .iter()
            .position(|r| r.device_addr == device_addr && r.data_offset == data_offset)?;
        Some(self.read_only.remove(i))
    }

    /// Read-only references not part of the last DPB list, for which no release has been
    /// requested yet.
    pub fn non_reference_buffers(&self) -> Vec<ReadOnlyRef> {
        let Some(dpb) = &self.dpb_list else {
            return Vec::new();
        };
        self.read_only
            .iter()
            .filter(|r| !r.pending_release && !dpb.iter().any(|addr| *addr as u64 == r.device_addr))
            .copied()
            .collect()
    }

    /// Find a client buffer by backing memory and data offset.
    pub fn find_client_buffer(&self, desc: &BufferDescriptor) -> Option<usize> {
        self.get(desc.buffer_type)
            .position(|b| b.memory == desc.memory && b.data_offset == desc.data_offset)
    }

    /// Find the deferred metadata buffer going along with data buffer `index` of type `t`.
    pub fn find_meta(&self, t: BufferType, index: u32) -> Option<usize> {
        let meta = t.meta_type()?;
        self.get(meta)
            .position(|b| b.index == index && b.state == BufferState::Deferred)
    }

    /// Count of buffers of the port of `t` currently owned by the firmware.
    pub fn queued_count(&self, t: BufferType) -> usize {
        let mut count = self.get(t).queued_count();
        if let Some(meta) = t.meta_type() {
            count += self.get(meta).queued_count();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfi_type_mapping() {
        let d = Domain::Decoder;
        let e = Domain::Encoder;

        assert_eq!(BufferType::Input.hfi_type(d), HfiBufferType::Bitstream);
        assert_eq!(BufferType::Input.hfi_port(d), HfiPort::Bitstream);
        assert_eq!(BufferType::Output.hfi_type(d), HfiBufferType::Raw);
        assert_eq!(BufferType::Dpb.hfi_port(d), HfiPort::Raw);
        assert_eq!(BufferType::Persist.hfi_port(d), HfiPort::Bitstream);
        assert_eq!(BufferType::Input.hfi_type(e), HfiBufferType::Raw);
        assert_eq!(BufferType::Vpss.hfi_port(e), HfiPort::Raw);
        assert_eq!(BufferType::Arp.hfi_port(e), HfiPort::Bitstream);
        assert_eq!(BufferType::OutputMeta.hfi_type(e), HfiBufferType::Metadata);
    }

    #[test]
    fn from_hfi_tables() {
        use HfiBufferType as H;
        let d = Domain::Decoder;
        let e = Domain::Encoder;

        assert_eq!(
            BufferType::from_hfi(d, HfiPort::Bitstream, H::Bitstream),
            Some(BufferType::Input)
        );
        assert_eq!(
            BufferType::from_hfi(d, HfiPort::Raw, H::Metadata),
            Some(BufferType::OutputMeta)
        );
        assert_eq!(
            BufferType::from_hfi(d, HfiPort::Bitstream, H::Persist),
            Some(BufferType::Persist)
        );
        assert_eq!(
            BufferType::from_hfi(d, HfiPort::Raw, H::Dpb),
            Some(BufferType::Dpb)
        );
        assert_eq!(BufferType::from_hfi(d, HfiPort::Raw, H::Bitstream), None);
        assert_eq!(BufferType::from_hfi(d, HfiPort::Bitstream, H::Arp), None);
        assert_eq!(BufferType::from_hfi(d, HfiPort::None, H::Metadata), None);

        assert_eq!(
            BufferType::from_hfi(e, HfiPort::Raw, H::Raw),
            Some(BufferType::Input)
        );
        assert_eq!(
            BufferType::from_hfi(e, HfiPort::Raw, H::Vpss),
            Some(BufferType::Vpss)
        );
        assert_eq!(
            BufferType::from_hfi(e, HfiPort::Bitstream, H::Arp),
            Some(BufferType::Arp)
        );
        assert_eq!(BufferType::from_hfi(e, HfiPort::Bitstream, H::Persist), None);
        assert_eq!(BufferType::from_hfi(e, HfiPort::Bitstream, H::Subcache), None);
    }

    #[test]
    fn flags_from_frame_info() {
        let mut frame = FrameInfo {
            picture_type: HfiPictureType::I,
            ..Default::default()
        };
        assert_eq!(
            driver_flags(Codec::H264, HfiBufferFlags::empty(), &frame),
            BufferFlags::empty()
        );
        assert_eq!(
            driver_flags(Codec::Vp9, HfiBufferFlags::empty(), &frame),
            BufferFlags::KEYFRAME
        );

        frame.picture_type = HfiPictureType::CRA;
        frame.data_corrupt = true;
        assert_eq!(
            driver_flags(
                Codec::Hevc,
                HfiBufferFlags::LAST | HfiBufferFlags::CODEC_CONFIG,
                &frame
            ),
            BufferFlags::KEYFRAME
                | BufferFlags::ERROR
                | BufferFlags::LAST
                | BufferFlags::CODEC_CONFIG
        );

        frame = FrameInfo {
            picture_type: HfiPictureType::B,
            ..Default::default()
        };
        assert_eq!(
            driver_flags(Codec::H264, HfiBufferFlags::READ_ONLY, &frame),
            BufferFlags::BFRAME
        );
    }

    fn output(index: u32, memory: u64, addr: u64) -> Buffer {
        let mut b = Buffer::from_descriptor(&BufferDescriptor {
            buffer_type: BufferType::Output,
            index,
            memory: MemoryHandle(memory),
            buffer_size: 0x1000,
            data_offset: 0,
            data_size: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
        });
        b.device_addr = addr;
        b
    }

    #[test]
    fn read_only_list() {
        let mut buffers = SessionBuffers::default();
        let a = output(0, 1, 0x1000);
        let b = output(1, 2, 0x2000);

        buffers.add_read_only(&a);
        buffers.add_read_only(&a);
        buffers.add_read_only(&b);
        assert_eq!(buffers.read_only.len(), 2);
        assert_eq!(buffers.read_only_position(MemoryHandle(2)), Some(1));

        // No DPB list received yet.
        assert!(buffers.non_reference_buffers().is_empty());
        buffers.dpb_list = Some(vec![0x2000]);
        let nonref = buffers.non_reference_buffers();
        assert_eq!(nonref.len(), 1);
        assert_eq!(nonref[0].memory, MemoryHandle(1));

        assert!(buffers.remove_read_only(0x1000, 0).is_some());
        assert!(buffers.remove_read_only(0x1000, 0).is_none());
        assert_eq!(buffers.read_only.len(), 1);
    }

    #[test]
    fn collections() {
        let mut buffers = SessionBuffers::default();
        let mut meta = output(3, 5, 0x5000);
        meta.buffer_type = BufferType::OutputMeta;
        buffers.get_mut(BufferType::OutputMeta).list.push(meta);
        buffers.get_mut(BufferType::Output).list.push(output(3, 6, 0x6000));

        assert_eq!(buffers.find_meta(BufferType::Output, 3), Some(0));
        assert_eq!(buffers.find_meta(BufferType::Output, 4), None);
        assert_eq!(buffers.find_meta(BufferType::Bin, 3), None);

        buffers.get_mut(BufferType::Output).list[0].state = BufferState::Queued;
        buffers.get_mut(BufferType::OutputMeta).list[0].state = BufferState::Queued;
        assert_eq!(buffers.queued_count(BufferType::Output), 2);
        assert_eq!(buffers.get(BufferType::Input).queued_count(), 0);

        let drained = buffers
            .get_mut(BufferType::Output)
            .drain_where(|b| b.state == BufferState::Queued);
        assert_eq!(drained.len(), 1);
        assert!(buffers.get(BufferType::Output).list.is_empty());
    }

    #[test]
    fn hfi_descriptor() {
        let mut b = output(2, 1, 0xabc000);
        b.read_only = true;
        b.flags = BufferFlags::CODEC_CONFIG;
        let hfi = b.to_hfi(Domain::Decoder);
        assert_eq!(hfi.buffer_type, HfiBufferType::Raw as u32);
        assert_eq!(hfi.base_address, 0xabc000);
        assert_eq!(
            hfi.buffer_flags(),
            HfiBufferFlags::READ_ONLY | HfiBufferFlags::CODEC_CONFIG
        );
    }
}

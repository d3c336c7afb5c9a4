// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session data and operations.
//!
//! A [`Session`] holds the state machine, buffers, mappings and pending response work of one
//! client stream. Its operations are called with the session lock held, and transmit commands
//! through a [`CommandSender`] which takes the core lock only for the duration of the write.
//! Client notifications are not delivered directly: they are accumulated as [`SessionEvent`]s
//! which the core delivers once the session lock is released.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::buffer::Buffer;
use crate::buffer::BufferDescriptor;
use crate::buffer::BufferError;
use crate::buffer::BufferInfo;
use crate::buffer::BufferState;
use crate::buffer::BufferType;
use crate::buffer::FrameInfo;
use crate::buffer::SessionBuffers;
use crate::core::CoreError;
use crate::mapping::MappingManager;
use crate::mapping::Region;
use crate::packet;
use crate::packet::PacketError;
use crate::packet::PacketIds;
use crate::packet::Payload;
use crate::protocol::HfiBufferFlags;
use crate::protocol::HfiBufferType;
use crate::protocol::HfiCommand;
use crate::protocol::HfiPort;
use crate::protocol::HfiProperty;
use crate::protocol::HFI_MODE_PROPERTY;
use crate::response;
use crate::state;
use crate::state::Allow;
use crate::state::SessionState;
use crate::state::StreamingPorts;
use crate::work::WorkKind;
use crate::work::WorkQueue;
use crate::DeviceMemoryMapper;
use crate::ResourceHooks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Decoder,
    Encoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
    Vp9,
    Heic,
}

impl Codec {
    /// Value of the codec property for this codec in `domain`.
    pub fn hfi_id(self, domain: Domain) -> Option<u32> {
        match (self, domain) {
            (Codec::H264, Domain::Decoder) => Some(1),
            (Codec::H264, Domain::Encoder) => Some(2),
            (Codec::Hevc | Codec::Heic, Domain::Decoder) => Some(3),
            (Codec::Hevc | Codec::Heic, Domain::Encoder) => Some(4),
            (Codec::Vp9, Domain::Decoder) => Some(5),
            (Codec::Vp9, Domain::Encoder) => None,
        }
    }

    /// Properties reported by the firmware on an input port settings change.
    pub fn psc_properties(self) -> &'static [HfiProperty] {
        match self {
            Codec::H264 => &[
                HfiProperty::BitstreamResolution,
                HfiProperty::CropOffsets,
                HfiProperty::LumaChromaBitDepth,
                HfiProperty::BufferFwMinOutputCount,
                HfiProperty::PicOrderCntType,
                HfiProperty::Profile,
                HfiProperty::Level,
                HfiProperty::SignalColorInfo,
                HfiProperty::CodedFrames,
            ],
            Codec::Hevc | Codec::Heic => &[
                HfiProperty::BitstreamResolution,
                HfiProperty::CropOffsets,
                HfiProperty::LumaChromaBitDepth,
                HfiProperty::BufferFwMinOutputCount,
                HfiProperty::Profile,
                HfiProperty::Level,
                HfiProperty::Tier,
                HfiProperty::SignalColorInfo,
            ],
            Codec::Vp9 => &[
                HfiProperty::BitstreamResolution,
                HfiProperty::CropOffsets,
                HfiProperty::LumaChromaBitDepth,
                HfiProperty::BufferFwMinOutputCount,
                HfiProperty::Profile,
                HfiProperty::Level,
            ],
        }
    }
}

/// Properties the decoder output port subscribes to, reported along with output buffers.
const OUTPUT_PROPERTIES: [HfiProperty; 3] = [
    HfiProperty::PictureType,
    HfiProperty::NoOutput,
    HfiProperty::DpbList,
];

/// Client-visible port of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Input,
    Output,
    InputMeta,
    OutputMeta,
}

impl Port {
    pub fn buffer_type(self) -> BufferType {
        match self {
            Port::Input => BufferType::Input,
            Port::Output => BufferType::Output,
            Port::InputMeta => BufferType::InputMeta,
            Port::OutputMeta => BufferType::OutputMeta,
        }
    }

    /// Port of client buffers of type `t`.
    pub fn of_buffer_type(t: BufferType) -> Option<Port> {
        match t {
            BufferType::Input => Some(Port::Input),
            BufferType::Output => Some(Port::Output),
            BufferType::InputMeta => Some(Port::InputMeta),
            BufferType::OutputMeta => Some(Port::OutputMeta),
            _ => None,
        }
    }

    /// Data port this port belongs to.
    pub fn data_port(self) -> Port {
        match self {
            Port::Input | Port::InputMeta => Port::Input,
            Port::Output | Port::OutputMeta => Port::Output,
        }
    }

    pub fn is_meta(self) -> bool {
        matches!(self, Port::InputMeta | Port::OutputMeta)
    }

    pub fn hfi_port(self, domain: Domain) -> HfiPort {
        match (domain, self.data_port()) {
            (Domain::Decoder, Port::Input) | (Domain::Encoder, Port::Output) => HfiPort::Bitstream,
            _ => HfiPort::Raw,
        }
    }

    /// Data port using `port` in `domain`.
    pub fn from_hfi(domain: Domain, port: HfiPort) -> Option<Port> {
        match (domain, port) {
            (Domain::Decoder, HfiPort::Bitstream) | (Domain::Encoder, HfiPort::Raw) => {
                Some(Port::Input)
            }
            (Domain::Decoder, HfiPort::Raw) | (Domain::Encoder, HfiPort::Bitstream) => {
                Some(Port::Output)
            }
            (_, HfiPort::None) => None,
        }
    }
}

/// Parameters of a session, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub domain: Domain,
    pub codec: Codec,
    /// Buffers live in secure memory.
    pub secure: bool,
    /// Data buffers of the input port come with a metadata buffer.
    pub input_meta: bool,
    /// Data buffers of the output port come with a metadata buffer.
    pub output_meta: bool,
}

impl SessionParams {
    pub fn new(domain: Domain, codec: Codec) -> Self {
        Self {
            domain,
            codec,
            secure: false,
            input_meta: false,
            output_meta: false,
        }
    }

    pub fn meta_enabled(&self, port: Port) -> bool {
        match port.data_port() {
            Port::Input => self.input_meta,
            _ => self.output_meta,
        }
    }

    /// Device address space region of buffers of type `t`.
    pub fn region(&self, t: BufferType) -> Region {
        if !self.secure {
            return Region::NonSecure;
        }
        match t {
            BufferType::Input | BufferType::Output => match t.hfi_port(self.domain) {
                HfiPort::Bitstream => Region::SecureBitstream,
                _ => Region::SecurePixel,
            },
            BufferType::Dpb => Region::SecurePixel,
            _ => Region::SecureNonPixel,
        }
    }
}

/// Stream parameters reported by the firmware for one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub bitstream_resolution: u32,
    pub crop_offsets: [u32; 2],
    pub bit_depth: u32,
    pub coded_frames: u32,
    pub fw_min_count: u32,
    pub pic_order_cnt: u32,
    pub color_info: u32,
    pub profile: u32,
    pub level: u32,
    pub tier: u32,
}

/// Notification to deliver to the client once the session lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    BufferDone(BufferInfo),
    PortSettingsChange(Port),
    Error,
}

/// Result of a successful buffer queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The buffer has been sent to the firmware.
    Queued,
    /// The buffer is kept by the driver until the state of the session allows sending it.
    Deferred,
}

/// Transmission of commands to the firmware.
pub trait CommandSender {
    /// Build a command using the shared packet identifiers and maximum command size, then write it
    /// to the command queue.
    fn send<F>(&self, build: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut PacketIds, usize) -> Result<Vec<u8>, PacketError>;
}

pub struct Session<M: DeviceMemoryMapper> {
    id: u32,
    params: SessionParams,
    pub(crate) state: SessionState,
    pub(crate) streaming: StreamingPorts,
    pub(crate) buffers: SessionBuffers,
    pub(crate) mappings: MappingManager<M>,
    subscriptions: [SubscriptionParams; 2],
    pub(crate) frame: FrameInfo,
    /// Input port settings change properties have been subscribed to.
    pub(crate) ipsc_properties_set: bool,
    /// A port settings change or last flag has been dropped since the last stream start.
    pub(crate) psc_or_last_flag_discarded: bool,
    pub(crate) work: WorkQueue,
    stop_pending: [bool; 2],
    close_pending: bool,
    error_reported: bool,
    events: Vec<SessionEvent>,
}

impl<M: DeviceMemoryMapper> Session<M> {
    pub fn new(id: u32, params: SessionParams, mapper: M) -> Result<Self, CoreError> {
        if params.codec.hfi_id(params.domain).is_none() {
            return Err(CoreError::Unsupported(params.codec, params.domain));
        }

        Ok(Self {
            id,
            params,
            state: SessionState::Open,
            streaming: Default::default(),
            buffers: Default::default(),
            mappings: MappingManager::from(mapper),
            subscriptions: Default::default(),
            frame: Default::default(),
            ipsc_properties_set: false,
            psc_or_last_flag_discarded: false,
            work: WorkQueue::new().map_err(CoreError::EventFd)?,
            stop_pending: [false; 2],
            close_pending: false,
            error_reported: false,
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn domain(&self) -> Domain {
        self.params.domain
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self, port: Port) -> bool {
        self.streaming.is_streaming(port)
    }

    pub fn buffers(&self) -> &SessionBuffers {
        &self.buffers
    }

    pub fn mappings(&self) -> &MappingManager<M> {
        &self.mappings
    }

    /// Stream parameters last reported by the firmware for the data port of `port`.
    pub fn subscription(&self, port: Port) -> &SubscriptionParams {
        &self.subscriptions[Self::port_slot(port)]
    }

    pub(crate) fn subscription_mut(&mut self, port: Port) -> &mut SubscriptionParams {
        &mut self.subscriptions[Self::port_slot(port)]
    }

    fn port_slot(port: Port) -> usize {
        match port.data_port() {
            Port::Input => 0,
            _ => 1,
        }
    }

    pub(crate) fn stop_pending(&self, port: Port) -> bool {
        self.stop_pending[Self::port_slot(port)]
    }

    pub(crate) fn stop_done(&mut self, port: Port) {
        self.stop_pending[Self::port_slot(port)] = false;
    }

    pub(crate) fn close_pending(&self) -> bool {
        self.close_pending
    }

    pub(crate) fn close_done(&mut self) {
        self.close_pending = false;
    }

    /// Stop waiting for stop and close replies that will never arrive.
    pub(crate) fn abort_pending(&mut self) {
        self.stop_pending = [false; 2];
        self.close_pending = false;
    }

    /// Return the notifications accumulated since the last call.
    pub(crate) fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn push_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Apply a state change. Moving to [`SessionState::Error`] also reports the error to the
    /// client, once.
    pub(crate) fn set_state(&mut self, new: SessionState) {
        if new == SessionState::Error {
            self.report_error();
        } else {
            self.state.transition(new, self.id);
        }
    }

    pub(crate) fn report_error(&mut self) {
        if self.state != SessionState::Error {
            error!("[{:08x}] session error in state {}", self.id, self.state);
        }
        self.state.transition(SessionState::Error, self.id);
        if !self.error_reported {
            self.error_reported = true;
            self.events.push(SessionEvent::Error);
        }
    }

    fn check_not_error(&self) -> Result<(), CoreError> {
        if self.state == SessionState::Error {
            return Err(CoreError::SessionError(self.id));
        }
        Ok(())
    }

    fn send_command<C: CommandSender>(
        &self,
        tx: &C,
        cmd: HfiCommand,
        port: HfiPort,
        payload: Payload,
    ) -> Result<(), CoreError> {
        let id = self.id;
        tx.send(|ids, max| packet::session_command(ids, max, id, cmd, port, payload))
    }

    /// Send the open command and the codec of the session.
    pub(crate) fn open<C: CommandSender>(&mut self, tx: &C) -> Result<(), CoreError> {
        let id = self.id;
        let codec = self
            .params
            .codec
            .hfi_id(self.params.domain)
            .ok_or(CoreError::Unsupported(self.params.codec, self.params.domain))?;

        self.send_command(tx, HfiCommand::Open, HfiPort::None, Payload::U32(id))?;
        tx.send(|ids, max| {
            packet::session_property(
                ids,
                max,
                id,
                HfiProperty::Codec,
                HfiPort::None,
                Payload::U32Enum(codec),
            )
        })?;
        info!("[{:08x}] session opened ({:?})", id, self.params.codec);

        Ok(())
    }

    fn subscribe<C: CommandSender>(&mut self, tx: &C, port: Port) -> Result<(), CoreError> {
        let id = self.id;
        let hfi_port = port.hfi_port(self.params.domain);

        match port {
            Port::Input if !self.ipsc_properties_set => {
                let properties = self.params.codec.psc_properties();
                tx.send(|ids, max| packet::subscribe_psc(ids, max, id, hfi_port, properties))?;
                self.ipsc_properties_set = true;
            }
            Port::Output => {
                let payload: Vec<u32> = std::iter::once(HFI_MODE_PROPERTY)
                    .chain(OUTPUT_PROPERTIES.iter().map(|p| *p as u32))
                    .collect();
                self.send_command(
                    tx,
                    HfiCommand::SubscribeMode,
                    hfi_port,
                    Payload::U32Array(&payload),
                )?;
            }
            _ => (),
        }

        Ok(())
    }

    /// Start streaming on `port`.
    pub(crate) fn streamon<C: CommandSender, H: ResourceHooks + ?Sized>(
        &mut self,
        tx: &C,
        hooks: &H,
        port: Port,
    ) -> Result<(), CoreError> {
        self.check_not_error()?;
        if !state::allow_streamon(self.state, port) {
            error!(
                "[{:08x}] streamon({:?}) not allowed in state {}",
                self.id, port, self.state
            );
            return Err(CoreError::NotAllowed {
                op: "streamon",
                state: self.state,
            });
        }

        if port.is_meta() {
            self.streaming.set(port, true);
            return Ok(());
        }

        let domain = self.params.domain;
        if self.params.domain == Domain::Decoder {
            self.subscribe(tx, port)?;
        }

        hooks.scale_power(self.id);
        self.prepare_internal_buffers(tx, hooks, port)?;
        self.send_command(tx, HfiCommand::Start, port.hfi_port(domain), Payload::None)?;
        self.streaming.set(port, true);
        self.psc_or_last_flag_discarded = false;

        let target = state::streamon_target(self.state, port);
        let new_state = if target.replay_input_psc {
            response::replay_input_psc(self, target.state)
        } else {
            target.state
        };
        self.set_state(new_state);
        info!("[{:08x}] streamon({:?}), state {}", self.id, port, self.state);

        self.queue_deferred(tx, port)
    }

    /// First half of stopping `port`: send the stop command.
    ///
    /// Returns `true` if the caller must wait for the firmware to acknowledge the stop before
    /// calling [`Session::streamoff_complete`].
    pub(crate) fn streamoff_begin<C: CommandSender>(
        &mut self,
        tx: &C,
        port: Port,
    ) -> Result<bool, CoreError> {
        match state::allow_streamoff(port, &self.streaming) {
            Allow::Ignore => {
                debug!("[{:08x}] streamoff({:?}) ignored", self.id, port);
                return Ok(false);
            }
            Allow::Allow => (),
            _ => {
                error!(
                    "[{:08x}] streamoff({:?}) not allowed in state {}",
                    self.id, port, self.state
                );
                return Err(CoreError::NotAllowed {
                    op: "streamoff",
                    state: self.state,
                });
            }
        }

        if port.is_meta() {
            self.streaming.set(port, false);
            self.flush_buffers(port.buffer_type());
            return Ok(false);
        }

        if self.state == SessionState::Error {
            self.streamoff_complete(port, Err(CoreError::SessionError(self.id)))?;
            return Ok(false);
        }

        let hfi_port = port.hfi_port(self.params.domain);
        self.stop_pending[Self::port_slot(port)] = true;
        if let Err(e) = self.send_command(tx, HfiCommand::Stop, hfi_port, Payload::None) {
            self.stop_pending[Self::port_slot(port)] = false;
            self.streamoff_complete(port, Err(e))?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Second half of stopping `port`, once the firmware acknowledged the stop or `result` tells
    /// why it could not.
    pub(crate) fn streamoff_complete(
        &mut self,
        port: Port,
        result: Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let buffer_type = port.buffer_type();
        self.stop_pending[Self::port_slot(port)] = false;
        self.streaming.set(port, false);

        if let Err(e) = result {
            error!("[{:08x}] streamoff({:?}) failed: {:#}", self.id, port, e);
            self.report_error();
            self.flush_buffers(buffer_type);
            return Err(e);
        }

        match port {
            Port::Input => response::discard_pending_work(self, WorkKind::InputPsc),
            _ => {
                response::discard_pending_work(self, WorkKind::OutputPsc);
                response::flush_pending_last_flag(self);
            }
        }

        let new_state = state::streamoff_target(self.state, port);
        self.set_state(new_state);

        let queued = self.buffers.queued_count(buffer_type);
        if queued > 0 {
            error!(
                "[{:08x}] {} buffers still queued after streamoff({:?})",
                self.id, queued, port
            );
            self.report_error();
            self.flush_buffers(buffer_type);
            return Err(CoreError::BuffersNotReturned(queued));
        }

        self.flush_buffers(buffer_type);
        if port == Port::Output && self.params.domain == Domain::Decoder {
            self.flush_delayed_unmap();
        }
        info!("[{:08x}] streamoff({:?}), state {}", self.id, port, self.state);

        Ok(())
    }

    /// Queue a client buffer.
    pub(crate) fn queue_buffer<C: CommandSender, H: ResourceHooks + ?Sized>(
        &mut self,
        tx: &C,
        hooks: &H,
        desc: &BufferDescriptor,
    ) -> Result<QueueOutcome, CoreError> {
        self.check_not_error()?;
        let t = desc.buffer_type;
        let port = Port::of_buffer_type(t).ok_or(BufferError::NotClientType(t))?;

        if !t.is_meta()
            && self.params.meta_enabled(port)
            && self.buffers.find_meta(t, desc.index).is_none()
        {
            error!(
                "[{:08x}] no metadata buffer queued for {:?} buffer {}",
                self.id, t, desc.index
            );
            return Err(BufferError::MissingMeta(t, desc.index).into());
        }

        let pos = self.acquire(desc)?;

        match state::allow_qbuf(self.state, port, &self.streaming) {
            Allow::Defer => {
                debug!("[{:08x}] deferring {:?} buffer {}", self.id, t, desc.index);
                return Ok(QueueOutcome::Deferred);
            }
            Allow::Allow => (),
            _ => {
                return Err(CoreError::NotAllowed {
                    op: "qbuf",
                    state: self.state,
                })
            }
        }

        hooks.scale_power(self.id);
        self.send_buffer(tx, t, pos)?;
        if t == BufferType::Output && self.params.domain == Domain::Decoder {
            self.release_nonref_buffers(tx)?;
        }

        Ok(QueueOutcome::Queued)
    }

    /// Find or create the driver buffer for `desc`, mapping it if it is new.
    fn acquire(&mut self, desc: &BufferDescriptor) -> Result<usize, CoreError> {
        let t = desc.buffer_type;
        let decoder_output = t == BufferType::Output && self.params.domain == Domain::Decoder;

        if let Some(pos) = self.buffers.find_client_buffer(desc) {
            let buf = &mut self.buffers.get_mut(t).list[pos];
            if buf.state != BufferState::Retained {
                warn!(
                    "[{:08x}] {:?} buffer {} queued again while {:?}",
                    self.id, t, desc.index, buf.state
                );
                return Err(BufferError::Duplicate(t, desc.index).into());
            }
            // The firmware still reads this buffer: send it back with the read-only attribute.
            buf.index = desc.index;
            buf.buffer_size = desc.buffer_size;
            buf.data_size = desc.data_size;
            buf.timestamp = desc.timestamp;
            buf.flags = desc.flags;
            buf.state = BufferState::Deferred;
            buf.done = false;
            return Ok(pos);
        }

        let region = self.params.region(t);
        let device_addr = self.mappings.map(
            desc.memory,
            desc.buffer_size as u64,
            region,
            decoder_output,
        )?;

        let mut buf = Buffer::from_descriptor(desc);
        buf.device_addr = device_addr;
        if decoder_output {
            buf.read_only = self
                .buffers
                .read_only
                .iter()
                .any(|r| r.device_addr == device_addr && r.data_offset == desc.data_offset);
        }
        debug!(
            "[{:08x}] new {:?} buffer {} at {:#x}",
            self.id, t, desc.index, device_addr
        );

        let list = &mut self.buffers.get_mut(t).list;
        list.push(buf);
        Ok(list.len() - 1)
    }

    /// Send the buffer at `pos` of the collection of `t` to the firmware, along with its metadata
    /// buffer if needed.
    fn send_buffer<C: CommandSender>(
        &mut self,
        tx: &C,
        t: BufferType,
        pos: usize,
    ) -> Result<(), CoreError> {
        let id = self.id;
        let domain = self.params.domain;
        let port = Port::of_buffer_type(t).ok_or(BufferError::NotClientType(t))?;
        let meta_pos = if self.params.meta_enabled(port) {
            let index = self.buffers.get(t).list[pos].index;
            Some(
                self.buffers
                    .find_meta(t, index)
                    .ok_or(BufferError::MissingMeta(t, index))?,
            )
        } else {
            None
        };

        let hfi = self.buffers.get(t).list[pos].to_hfi(domain);
        let meta = match (t.meta_type(), meta_pos) {
            (Some(meta_type), Some(meta_pos)) => {
                Some(self.buffers.get(meta_type).list[meta_pos].to_hfi(domain))
            }
            _ => None,
        };
        let hfi_port = port.hfi_port(domain);
        tx.send(|ids, max| packet::queue_buffer(ids, max, id, hfi_port, hfi, meta))?;

        self.buffers.get_mut(t).list[pos].state = BufferState::Queued;
        if let (Some(meta_type), Some(meta_pos)) = (t.meta_type(), meta_pos) {
            self.buffers.get_mut(meta_type).list[meta_pos].state = BufferState::Queued;
        }
        debug!(
            "[{:08x}] queued {:?} buffer {} at {:#x}",
            id, t, hfi.index, hfi.base_address
        );

        Ok(())
    }

    /// Send all the deferred data buffers of `port`.
    fn queue_deferred<C: CommandSender>(&mut self, tx: &C, port: Port) -> Result<(), CoreError> {
        let t = port.buffer_type();
        let deferred: Vec<usize> = self
            .buffers
            .get(t)
            .list
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BufferState::Deferred)
            .map(|(i, _)| i)
            .collect();

        for pos in deferred {
            self.send_buffer(tx, t, pos)?;
        }
        if t == BufferType::Output && self.params.domain == Domain::Decoder {
            self.release_nonref_buffers(tx)?;
        }

        Ok(())
    }

    /// Drain the session.
    pub(crate) fn drain<C: CommandSender>(&mut self, tx: &C) -> Result<(), CoreError> {
        self.check_not_error()?;
        match state::allow_stop(self.state) {
            Allow::Allow => (),
            Allow::Ignore => {
                debug!("[{:08x}] drain ignored in state {}", self.id, self.state);
                return Ok(());
            }
            _ => {
                error!("[{:08x}] drain not allowed in state {}", self.id, self.state);
                return Err(CoreError::NotAllowed {
                    op: "drain",
                    state: self.state,
                });
            }
        }

        let hfi_port = Port::Input.hfi_port(self.params.domain);
        self.send_command(tx, HfiCommand::Drain, hfi_port, Payload::None)?;

        match state::stop_target(self.state) {
            Some(new_state) => self.set_state(new_state),
            None => self.report_error(),
        }
        info!("[{:08x}] drain, state {}", self.id, self.state);

        Ok(())
    }

    /// Resume the session after a last flag.
    pub(crate) fn resume<C: CommandSender, H: ResourceHooks + ?Sized>(
        &mut self,
        tx: &C,
        hooks: &H,
    ) -> Result<(), CoreError> {
        self.check_not_error()?;
        if !state::allow_start(self.state) {
            error!("[{:08x}] start not allowed in state {}", self.id, self.state);
            return Err(CoreError::NotAllowed {
                op: "start",
                state: self.state,
            });
        }

        let port = if self.state == SessionState::DrainLastFlag {
            Port::Input
        } else {
            Port::Output
        };

        let Some(target) = state::start_target(self.state) else {
            self.report_error();
            return Err(CoreError::SessionError(self.id));
        };
        let new_state = response::replay_input_psc(self, target);
        self.set_state(new_state);
        self.check_not_error()?;

        if port == Port::Output {
            // The output port is reconfigured after a resolution change.
            self.prepare_internal_buffers(tx, hooks, Port::Output)?;
        }
        self.send_command(
            tx,
            HfiCommand::Resume,
            port.hfi_port(self.params.domain),
            Payload::None,
        )?;
        info!("[{:08x}] start({:?}), state {}", self.id, port, self.state);

        self.queue_deferred(tx, Port::Input)?;
        self.queue_deferred(tx, Port::Output)
    }

    /// Send the close command.
    ///
    /// Returns `true` if the caller must wait for the firmware to acknowledge the close.
    pub(crate) fn close_begin<C: CommandSender>(&mut self, tx: &C) -> bool {
        if self.state == SessionState::Error {
            return false;
        }
        self.close_pending = true;
        if let Err(e) = self.send_command(tx, HfiCommand::Close, HfiPort::None, Payload::None) {
            error!("[{:08x}] failed to send close: {:#}", self.id, e);
            self.close_pending = false;
            return false;
        }
        true
    }

    /// Best-effort close of a session that can no longer be used.
    pub(crate) fn kill<C: CommandSender>(&mut self, tx: &C) {
        if self.state != SessionState::Error {
            if let Err(e) = self.send_command(tx, HfiCommand::Close, HfiPort::None, Payload::None) {
                error!("[{:08x}] failed to send close: {:#}", self.id, e);
            }
        }
        self.report_error();
    }

    /// Release every resource of the session.
    pub(crate) fn destroy(&mut self) {
        self.work.clear();

        for t in BufferType::ALL {
            let buffers = std::mem::take(&mut self.buffers.get_mut(t).list);
            for buf in buffers {
                if !t.is_internal() && !buf.done {
                    self.notify_flushed(buf.clone());
                }
                if let Err(e) = self.mappings.unmap(buf.memory) {
                    debug!("[{:08x}] {:#}", self.id, e);
                }
                if t.is_internal() {
                    self.free_memory(buf.memory);
                }
            }
        }
        self.buffers.read_only.clear();
        self.buffers.dpb_list = None;
        self.mappings.unmap_all();
        info!("[{:08x}] session destroyed", self.id);
    }

    fn free_memory(&mut self, memory: crate::mapping::MemoryHandle) {
        if let Err(e) = self.mappings.mapper_mut().free(memory) {
            error!("[{:08x}] failed to free {:?}: {}", self.id, memory, e);
        }
    }

    fn notify_flushed(&mut self, mut buf: Buffer) {
        buf.data_size = 0;
        buf.done = true;
        self.events.push(SessionEvent::BufferDone(buf.info()));
    }

    /// Return all the client buffers of type `t` and of its metadata type.
    fn flush_buffers(&mut self, t: BufferType) {
        let types = std::iter::once(t).chain(t.meta_type());
        for t in types.collect::<Vec<_>>() {
            let flushed = self.buffers.get_mut(t).drain_where(|_| true);
            for buf in flushed {
                debug!("[{:08x}] flushing {:?} buffer {}", self.id, t, buf.index);
                if let Err(e) = self.mappings.unmap(buf.memory) {
                    error!("[{:08x}] {:#}", self.id, e);
                }
                if !buf.done {
                    self.notify_flushed(buf);
                }
            }
        }
    }

    /// Remove the mappings of decoder output buffers which the firmware does not reference
    /// anymore.
    fn flush_delayed_unmap(&mut self) {
        for (memory, refcount) in self.mappings.delayed_mappings() {
            if self.buffers.read_only_position(memory).is_some() {
                continue;
            }
            if refcount > 1 {
                error!(
                    "[{:08x}] {:?} still has {} users on delayed unmap",
                    self.id, memory, refcount
                );
            }
            if let Err(e) = self.mappings.unmap_completely(memory) {
                error!("[{:08x}] {:#}", self.id, e);
            }
        }
    }

    /// Ask the firmware to release the read-only buffers that are no longer part of its decoded
    /// picture buffer.
    fn release_nonref_buffers<C: CommandSender>(&mut self, tx: &C) -> Result<(), CoreError> {
        let id = self.id;
        for r in self.buffers.non_reference_buffers() {
            let hfi = crate::protocol::HfiBuffer {
                buffer_type: HfiBufferType::Raw as u32,
                index: r.index,
                base_address: r.device_addr,
                addr_offset: 0,
                buffer_size: r.buffer_size,
                data_offset: r.data_offset,
                data_size: 0,
                timestamp: 0,
                flags: HfiBufferFlags::READ_ONLY.bits(),
                reserved: [0; 5],
            };
            tx.send(|ids, max| packet::release_buffer(ids, max, id, HfiPort::Raw, hfi))?;
            if let Some(entry) = self
                .buffers
                .read_only
                .iter_mut()
                .find(|e| e.device_addr == r.device_addr && e.data_offset == r.data_offset)
            {
                entry.pending_release = true;
            }
            debug!(
                "[{:08x}] releasing non-reference buffer at {:#x}",
                id, r.device_addr
            );
        }

        Ok(())
    }

    /// Get the requirements, then create and queue the internal buffers used on `port`.
    fn prepare_internal_buffers<C: CommandSender, H: ResourceHooks + ?Sized>(
        &mut self,
        tx: &C,
        hooks: &H,
        port: Port,
    ) -> Result<(), CoreError> {
        let types = match port {
            Port::Input => BufferType::input_internal(self.params.domain),
            _ => BufferType::output_internal(self.params.domain),
        };

        for &t in types {
            self.get_internal_buffers(hooks, t);
            self.release_internal_buffers(tx, t)?;
            self.create_internal_buffers(t)?;
            self.queue_internal_buffers(tx, t)?;
        }

        Ok(())
    }

    /// Update the requirements of internal buffers of type `t`, deciding whether the existing
    /// buffers can be reused.
    fn get_internal_buffers<H: ResourceHooks + ?Sized>(&mut self, hooks: &H, t: BufferType) {
        let (size, count) = hooks.internal_buffer_requirements(self.id, t);
        let collection = self.buffers.get_mut(t);
        let live = collection
            .list
            .iter()
            .filter(|b| b.state != BufferState::PendingRelease)
            .count() as u32;

        collection.reuse = live > 0 && size <= collection.size && count <= live;
        if !collection.reuse {
            collection.size = size;
        }
        collection.min_count = count;
        collection.actual_count = count;
        debug!(
            "[{:08x}] {:?}: size {} count {} reuse {}",
            self.id, t, size, count, collection.reuse
        );
    }

    fn create_internal_buffers(&mut self, t: BufferType) -> Result<(), CoreError> {
        let collection = self.buffers.get(t);
        if collection.reuse || collection.size == 0 {
            return Ok(());
        }
        let size = collection.size;
        let missing = collection.actual_count as usize
            - collection
                .list
                .iter()
                .filter(|b| b.state != BufferState::PendingRelease)
                .count()
                .min(collection.actual_count as usize);
        let region = self.params.region(t);

        for _ in 0..missing {
            let memory = self
                .mappings
                .mapper_mut()
                .allocate(size as u64, region)
                .map_err(BufferError::Allocation)?;
            let device_addr = match self.mappings.map(memory, size as u64, region, false) {
                Ok(addr) => addr,
                Err(e) => {
                    self.free_memory(memory);
                    return Err(BufferError::Mapping(e).into());
                }
            };

            let collection = self.buffers.get_mut(t);
            let index = collection.list.len() as u32;
            collection.list.push(Buffer {
                buffer_type: t,
                index,
                memory,
                buffer_size: size,
                data_offset: 0,
                data_size: 0,
                device_addr,
                timestamp: 0,
                flags: crate::buffer::BufferFlags::empty(),
                state: BufferState::Deferred,
                read_only: false,
                done: false,
            });
            debug!(
                "[{:08x}] created {:?} buffer of {} bytes at {:#x}",
                self.id, t, size, device_addr
            );
        }

        Ok(())
    }

    fn queue_internal_buffers<C: CommandSender>(
        &mut self,
        tx: &C,
        t: BufferType,
    ) -> Result<(), CoreError> {
        let id = self.id;
        let domain = self.params.domain;
        let hfi_port = t.hfi_port(domain);

        for buf in self.buffers.get_mut(t).list.iter_mut() {
            if buf.state != BufferState::Deferred {
                continue;
            }
            let hfi = buf.to_hfi(domain);
            tx.send(|ids, max| packet::queue_buffer(ids, max, id, hfi_port, hfi, None))?;
            buf.state = BufferState::Queued;
        }

        Ok(())
    }

    /// Ask the firmware to release the internal buffers of type `t`, unless they are reused.
    fn release_internal_buffers<C: CommandSender>(
        &mut self,
        tx: &C,
        t: BufferType,
    ) -> Result<(), CoreError> {
        if self.buffers.get(t).reuse {
            return Ok(());
        }

        let id = self.id;
        let domain = self.params.domain;
        let hfi_port = t.hfi_port(domain);

        // Buffers the firmware never saw can go away right now.
        let unused = self
            .buffers
            .get_mut(t)
            .drain_where(|b| b.state == BufferState::Deferred);
        for buf in unused {
            if let Err(e) = self.mappings.unmap(buf.memory) {
                error!("[{:08x}] {:#}", self.id, e);
            }
            self.free_memory(buf.memory);
        }

        for buf in self.buffers.get_mut(t).list.iter_mut() {
            if buf.state != BufferState::Queued {
                continue;
            }
            let hfi = buf.to_hfi(domain);
            tx.send(|ids, max| packet::release_buffer(ids, max, id, hfi_port, hfi))?;
            buf.state = BufferState::PendingRelease;
        }

        Ok(())
    }

    /// Destroy the internal buffer at `device_addr` once the firmware released it.
    pub(crate) fn destroy_internal_buffer(
        &mut self,
        t: BufferType,
        device_addr: u64,
    ) -> Result<(), CoreError> {
        let Some(pos) = self
            .buffers
            .get(t)
            .position(|b| b.device_addr == device_addr)
        else {
            error!(
                "[{:08x}] release done for unknown {:?} buffer at {:#x}",
                self.id, t, device_addr
            );
            return Err(CoreError::UnknownBuffer(device_addr));
        };

        let buf = self.buffers.get_mut(t).list.remove(pos);
        if buf.state != BufferState::PendingRelease {
            warn!(
                "[{:08x}] {:?} buffer at {:#x} released while {:?}",
                self.id, t, device_addr, buf.state
            );
        }
        if let Err(e) = self.mappings.unmap(buf.memory) {
            error!("[{:08x}] {:#}", self.id, e);
        }
        self.free_memory(buf.memory);
        debug!(
            "[{:08x}] destroyed {:?} buffer at {:#x}",
            self.id, t, device_addr
        );

        Ok(())
    }
}

impl<M: DeviceMemoryMapper> AsFd for Session<M> {
    /// FD signaled while response work is waiting to be processed by
    /// [`crate::Core::process_pending_work`].
    fn as_fd(&self) -> BorrowedFd {
        self.work.as_fd()
    }
}

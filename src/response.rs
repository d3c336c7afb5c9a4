// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dispatching of firmware responses addressed to a session.
//!
//! Packets are routed by the range their type falls into. All the packets of a response are
//! visited once per range, in the order session errors, information, properties and commands,
//! so that the frame information carried by properties is known when the buffer completions of
//! the same response are handled. Buffer completions only mark buffers as dequeued; a final pass
//! reports them to the client once every packet of the response has been processed.
//!
//! Responses carrying a port settings change or a buffer with the last flag are not processed
//! right away but queued to the session [`crate::work::WorkQueue`], and processed by
//! [`process_work`] once the session state allows it.

use log::debug;
use log::error;
use log::warn;

use crate::buffer::driver_flags;
use crate::buffer::BufferState;
use crate::buffer::BufferType;
use crate::core::CoreError;
use crate::mapping::MappingError;
use crate::packet::parse_response;
use crate::packet::Response;
use crate::packet::ResponsePacket;
use crate::protocol::*;
use crate::session::Domain;
use crate::session::Port;
use crate::session::Session;
use crate::session::SessionEvent;
use crate::state;
use crate::state::Allow;
use crate::state::SessionState;
use crate::work::ResponseWork;
use crate::work::WorkKind;
use crate::DeviceMemoryMapper;

type PacketHandler<M> = fn(&mut Session<M>, &ResponsePacket) -> Result<(), CoreError>;

/// Kind of work `response` must be offloaded as, if any.
pub fn offload_kind(domain: Domain, response: &Response) -> Option<WorkKind> {
    for pkt in &response.packets {
        if pkt.packet_type() == HfiCommand::SettingsChange as u32 {
            match pkt.port() {
                Some(HfiPort::Bitstream) => return Some(WorkKind::InputPsc),
                Some(HfiPort::Raw) => return Some(WorkKind::OutputPsc),
                _ => (),
            }
        } else if pkt.packet_type() == HfiCommand::Buffer as u32
            && pkt.port().and_then(|p| Port::from_hfi(domain, p)) == Some(Port::Output)
        {
            if let Ok(buffer) = pkt.buffer() {
                if buffer.buffer_flags().contains(HfiBufferFlags::LAST) {
                    return Some(WorkKind::LastFlag);
                }
            }
        }
    }

    None
}

/// Handle a response addressed to `session`, either right away or by offloading it.
pub(crate) fn handle_session_response<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    bytes: &[u8],
) {
    let response = match parse_response(bytes) {
        Ok(response) => response,
        Err(e) => {
            error!("[{:08x}] dropping invalid response: {:#}", session.id(), e);
            return;
        }
    };

    if let Some(kind) = offload_kind(session.domain(), &response) {
        let size = response.header.size as usize;
        let work = ResponseWork {
            kind,
            data: bytes[..size].to_vec(),
        };
        match session.work.push(work) {
            Ok(Some(_)) => warn!(
                "[{:08x}] pending {:?} work replaced by a newer one",
                session.id(),
                kind
            ),
            Ok(None) => debug!("[{:08x}] queued {:?} work", session.id(), kind),
            Err(e) => {
                error!("[{:08x}] failed to queue {:?} work: {:#}", session.id(), kind, e);
                session.report_error();
            }
        }
        return;
    }

    process_response(session, &response);
}

fn process_bytes<M: DeviceMemoryMapper>(session: &mut Session<M>, bytes: &[u8]) {
    match parse_response(bytes) {
        Ok(response) => process_response(session, &response),
        Err(e) => {
            error!("[{:08x}] invalid offloaded response: {:#}", session.id(), e);
            session.report_error();
        }
    }
}

/// Apply every packet of `response` to `session`.
pub(crate) fn process_response<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    response: &Response,
) {
    if let Some(pkt) = response
        .packets
        .iter()
        .find(|p| p.flags().contains(FwFlags::SESSION_ERROR))
    {
        error!(
            "[{:08x}] session error reported by {}",
            session.id(),
            PacketTypeName(pkt.packet_type())
        );
        session.report_error();
        return;
    }

    let bands: [(HfiRange, PacketHandler<M>); 4] = [
        (HFI_SESSION_ERROR_RANGE, handle_session_error),
        (HFI_INFORMATION_RANGE, handle_info),
        (HFI_PROP_RANGE, handle_property),
        (HFI_CMD_RANGE, handle_command),
    ];

    session.frame = Default::default();
    let mut dequeue = false;
    for (range, handler) in bands {
        for pkt in response.packets.iter() {
            if !range.contains(pkt.packet_type()) {
                continue;
            }
            dequeue |= pkt.packet_type() == HfiCommand::Buffer as u32;
            if let Err(e) = handler(session, pkt) {
                error!(
                    "[{:08x}] error while handling {}: {:#}",
                    session.id(),
                    PacketTypeName(pkt.packet_type()),
                    e
                );
                session.report_error();
            }
        }
    }

    if dequeue {
        dequeue_buffers(session);
    }
    session.frame = Default::default();
}

fn handle_session_error<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    pkt: &ResponsePacket,
) -> Result<(), CoreError> {
    error!(
        "[{:08x}] firmware error {}",
        session.id(),
        PacketTypeName(pkt.packet_type())
    );
    session.report_error();
    Ok(())
}

fn handle_info<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    pkt: &ResponsePacket,
) -> Result<(), CoreError> {
    match HfiInformation::n(pkt.packet_type()) {
        Some(HfiInformation::DataCorrupt) => {
            debug!("[{:08x}] data corrupt", session.id());
            session.frame.data_corrupt = true;
        }
        Some(HfiInformation::BufferOverflow) => {
            debug!("[{:08x}] buffer overflow", session.id());
            session.frame.overflow = true;
        }
        Some(HfiInformation::Unsupported) => {
            warn!("[{:08x}] firmware reports unsupported content", session.id());
        }
        None => warn!(
            "[{:08x}] unknown information {:#010x}",
            session.id(),
            pkt.packet_type()
        ),
    }
    Ok(())
}

fn handle_property<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    pkt: &ResponsePacket,
) -> Result<(), CoreError> {
    let Some(property) = HfiProperty::n(pkt.packet_type()) else {
        debug!(
            "[{:08x}] ignoring property {:#010x}",
            session.id(),
            pkt.packet_type()
        );
        return Ok(());
    };
    if !pkt.has_valid_payload() {
        warn!(
            "[{:08x}] dropping {:?} without a valid payload",
            session.id(),
            property
        );
        return Ok(());
    }

    let value = pkt.u32_at(0).unwrap_or(0);
    match property {
        HfiProperty::PictureType => {
            session.frame.picture_type = HfiPictureType::from_bits_retain(value)
        }
        HfiProperty::NoOutput => session.frame.no_output = value != 0,
        HfiProperty::SubframeInput => session.frame.subframe_input = value != 0,
        HfiProperty::DpbList => {
            let list = pkt.u32_array();
            debug!("[{:08x}] dpb list: {:x?}", session.id(), list);
            session.buffers.dpb_list = Some(list);
        }
        HfiProperty::ImageVersion | HfiProperty::Codec => {
            debug!("[{:08x}] ignoring property {:?}", session.id(), property)
        }
        _ => {
            let Some(port) = pkt.port().and_then(|p| Port::from_hfi(session.domain(), p)) else {
                warn!(
                    "[{:08x}] {:?} reported without a port",
                    session.id(),
                    property
                );
                return Ok(());
            };
            let params = session.subscription_mut(port);
            match property {
                HfiProperty::BitstreamResolution => params.bitstream_resolution = value,
                HfiProperty::CropOffsets => {
                    params.crop_offsets = [value, pkt.u32_at(1).unwrap_or(0)]
                }
                HfiProperty::LumaChromaBitDepth => params.bit_depth = value,
                HfiProperty::CodedFrames => params.coded_frames = value,
                HfiProperty::BufferFwMinOutputCount => params.fw_min_count = value,
                HfiProperty::PicOrderCntType => params.pic_order_cnt = value,
                HfiProperty::SignalColorInfo => params.color_info = value,
                HfiProperty::Profile => params.profile = value,
                HfiProperty::Level => params.level = value,
                HfiProperty::Tier => params.tier = value,
                _ => (),
            }
        }
    }

    Ok(())
}

fn handle_command<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    pkt: &ResponsePacket,
) -> Result<(), CoreError> {
    let id = session.id();
    let domain = session.domain();
    let Some(cmd) = HfiCommand::n(pkt.packet_type()) else {
        error!("[{:08x}] unknown command {:#010x}", id, pkt.packet_type());
        return Ok(());
    };
    if !pkt.flags().contains(FwFlags::SUCCESS) {
        debug!("[{:08x}] {:?} response without success flag", id, cmd);
    }

    match cmd {
        HfiCommand::Open
        | HfiCommand::Start
        | HfiCommand::Drain
        | HfiCommand::SubscribeMode
        | HfiCommand::DeliveryMode
        | HfiCommand::Resume
        | HfiCommand::Stability => debug!("[{:08x}] {:?} done", id, cmd),
        HfiCommand::Close => {
            debug!("[{:08x}] close done", id);
            session.close_done();
        }
        HfiCommand::Stop => match pkt.port().and_then(|p| Port::from_hfi(domain, p)) {
            Some(port) => {
                debug!("[{:08x}] stop({:?}) done", id, port);
                session.stop_done(port);
            }
            None => error!("[{:08x}] stop done on invalid port {:#x}", id, pkt.packet.port),
        },
        HfiCommand::Buffer => handle_buffer(session, pkt)?,
        HfiCommand::SettingsChange => {
            match pkt.port().and_then(|p| Port::from_hfi(domain, p)) {
                Some(port) => {
                    debug!("[{:08x}] {:?} port settings change", id, port);
                    session.push_event(SessionEvent::PortSettingsChange(port));
                }
                None => error!("[{:08x}] settings change on invalid port", id),
            }
        }
        HfiCommand::Init | HfiCommand::PowerCollapse | HfiCommand::Ssr => {
            error!("[{:08x}] unexpected session response {:?}", id, cmd)
        }
    }

    Ok(())
}

fn handle_buffer<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    pkt: &ResponsePacket,
) -> Result<(), CoreError> {
    if pkt.payload_type() == Some(HfiPayloadType::None) {
        debug!("[{:08x}] buffer packet without payload", session.id());
        return Ok(());
    }

    let buffer = pkt.buffer()?;
    let hfi_type = HfiBufferType::n(buffer.buffer_type)
        .ok_or(CoreError::InvalidBufferType(buffer.buffer_type))?;
    let port = pkt
        .port()
        .ok_or(CoreError::InvalidBufferType(buffer.buffer_type))?;
    let t = BufferType::from_hfi(session.domain(), port, hfi_type)
        .ok_or(CoreError::InvalidBufferType(buffer.buffer_type))?;

    if buffer.buffer_flags().contains(HfiBufferFlags::RELEASE_DONE) {
        if t.is_internal() {
            // Contract violations are logged by the callee.
            let _ = session.destroy_internal_buffer(t, buffer.base_address);
        } else if t == BufferType::Output && session.domain() == Domain::Decoder {
            release_output_done(session, &buffer);
        } else {
            warn!(
                "[{:08x}] unexpected release done for {:?} buffer",
                session.id(),
                t
            );
        }
        return Ok(());
    }

    match t {
        BufferType::Input => input_done(session, &buffer),
        BufferType::Output => output_done(session, &buffer),
        BufferType::InputMeta | BufferType::OutputMeta => meta_done(session, t, &buffer),
        _ => debug!(
            "[{:08x}] {:?} buffer returned at {:#x}",
            session.id(),
            t,
            buffer.base_address
        ),
    }

    Ok(())
}

/// Find the queued buffer of type `t` with `index`, or any buffer with that index.
fn find_by_index<M: DeviceMemoryMapper>(
    session: &Session<M>,
    t: BufferType,
    index: u32,
) -> Option<usize> {
    let collection = session.buffers.get(t);
    collection
        .position(|b| b.index == index && b.state == BufferState::Queued)
        .or_else(|| collection.position(|b| b.index == index))
}

fn input_done<M: DeviceMemoryMapper>(session: &mut Session<M>, hfi: &HfiBuffer) {
    let id = session.id();
    let codec = session.params().codec;
    let Some(pos) = find_by_index(session, BufferType::Input, hfi.index) else {
        error!(
            "[{:08x}] unknown input buffer {} at {:#x}",
            id, hfi.index, hfi.base_address
        );
        return;
    };

    let frame = session.frame;
    let buf = &mut session.buffers.get_mut(BufferType::Input).list[pos];
    if buf.state != BufferState::Queued {
        warn!(
            "[{:08x}] input buffer {} not queued ({:?})",
            id, buf.index, buf.state
        );
        return;
    }

    buf.data_size = hfi.data_size;
    buf.state = BufferState::Dequeued;
    buf.flags = driver_flags(codec, hfi.buffer_flags(), &frame);
    if frame.no_output {
        debug!("[{:08x}] input buffer {} produced no output", id, buf.index);
    }
    debug!("[{:08x}] input buffer {} done", id, buf.index);
}

fn output_done<M: DeviceMemoryMapper>(session: &mut Session<M>, hfi: &HfiBuffer) {
    let id = session.id();
    let codec = session.params().codec;
    let decoder = session.domain() == Domain::Decoder;
    let mut flags = hfi.buffer_flags();

    if decoder && !flags.contains(HfiBufferFlags::READ_ONLY) {
        // The firmware does not reference this buffer anymore.
        if session
            .buffers
            .remove_read_only(hfi.base_address, hfi.data_offset)
            .is_some()
        {
            debug!(
                "[{:08x}] buffer at {:#x} no longer read-only",
                id, hfi.base_address
            );
        }
    }

    let collection = session.buffers.get(BufferType::Output);
    let pos = if decoder {
        collection.position(|b| b.device_addr == hfi.base_address && b.data_offset == hfi.data_offset)
    } else {
        find_by_index(session, BufferType::Output, hfi.index)
    };
    let Some(pos) = pos else {
        error!(
            "[{:08x}] unknown output buffer {} at {:#x}",
            id, hfi.index, hfi.base_address
        );
        return;
    };

    let last_allowed = state::allow_last_flag(session.state);
    let frame = session.frame;
    let buf = &mut session.buffers.get_mut(BufferType::Output).list[pos];
    match buf.state {
        BufferState::Queued => (),
        BufferState::Retained if !flags.contains(HfiBufferFlags::READ_ONLY) => {
            debug!(
                "[{:08x}] retained output buffer {} released",
                id, buf.index
            );
            buf.read_only = false;
            buf.state = BufferState::Dequeued;
            return;
        }
        state => {
            warn!(
                "[{:08x}] output buffer {} not queued ({:?})",
                id, buf.index, state
            );
            return;
        }
    }

    buf.data_offset = hfi.data_offset;
    buf.data_size = hfi.data_size;
    buf.timestamp = hfi.timestamp;

    let mut discarded = false;
    if flags.contains(HfiBufferFlags::LAST) {
        // No payload comes with the last flag.
        buf.data_size = 0;
        flags.remove(HfiBufferFlags::READ_ONLY);
        if !last_allowed {
            flags.remove(HfiBufferFlags::LAST);
            discarded = true;
        }
    }

    let retained = decoder && flags.contains(HfiBufferFlags::READ_ONLY);
    buf.read_only = retained;
    buf.state = if retained {
        BufferState::Retained
    } else {
        BufferState::Dequeued
    };
    buf.flags = driver_flags(codec, flags, &frame);
    let snapshot = buf.clone();

    if discarded {
        warn!(
            "[{:08x}] last flag stripped from output buffer {} in state {}",
            id, snapshot.index, session.state
        );
        session.psc_or_last_flag_discarded = true;
    }
    if retained {
        debug!(
            "[{:08x}] output buffer {} retained read-only",
            id, snapshot.index
        );
        session.buffers.add_read_only(&snapshot);
    }
}

fn meta_done<M: DeviceMemoryMapper>(session: &mut Session<M>, t: BufferType, hfi: &HfiBuffer) {
    let id = session.id();
    let Some(pos) = find_by_index(session, t, hfi.index) else {
        error!("[{:08x}] unknown {:?} buffer {}", id, t, hfi.index);
        return;
    };

    let buf = &mut session.buffers.get_mut(t).list[pos];
    if buf.state != BufferState::Queued {
        warn!(
            "[{:08x}] {:?} buffer {} not queued ({:?})",
            id, t, buf.index, buf.state
        );
        return;
    }
    buf.data_size = hfi.data_size;
    buf.state = BufferState::Dequeued;
}

/// The firmware gave back a decoder output buffer it held as a reference.
fn release_output_done<M: DeviceMemoryMapper>(session: &mut Session<M>, hfi: &HfiBuffer) {
    let id = session.id();
    let Some(pos) = session.buffers.read_only.iter().position(|r| {
        r.pending_release && r.device_addr == hfi.base_address && r.data_offset == hfi.data_offset
    }) else {
        warn!(
            "[{:08x}] release done for unknown output buffer at {:#x}",
            id, hfi.base_address
        );
        return;
    };
    let released = session.buffers.read_only.remove(pos);

    for buf in session.buffers.get_mut(BufferType::Output).list.iter_mut() {
        if buf.device_addr != released.device_addr || buf.data_offset != released.data_offset {
            continue;
        }
        buf.read_only = false;
        if buf.state == BufferState::Retained {
            buf.state = BufferState::Dequeued;
        }
    }

    match session.mappings.put_delayed_unmap(released.memory) {
        Ok(_) | Err(MappingError::NoDelayedUnmap(_)) => (),
        Err(e) => error!("[{:08x}] {:#}", id, e),
    }
    debug!(
        "[{:08x}] output buffer at {:#x} released",
        id, released.device_addr
    );
}

/// Report the buffers dequeued by the last response to the client, and forget them.
fn dequeue_buffers<M: DeviceMemoryMapper>(session: &mut Session<M>) {
    const ORDER: [BufferType; 4] = [
        BufferType::InputMeta,
        BufferType::Input,
        BufferType::OutputMeta,
        BufferType::Output,
    ];

    for t in ORDER {
        let dequeued = session
            .buffers
            .get_mut(t)
            .drain_where(|b| b.state == BufferState::Dequeued);
        for mut buf in dequeued {
            if buf.done {
                debug!(
                    "[{:08x}] {:?} buffer {} already done",
                    session.id(),
                    t,
                    buf.index
                );
            } else {
                buf.done = true;
                session.push_event(SessionEvent::BufferDone(buf.info()));
            }
            if let Err(e) = session.mappings.unmap(buf.memory) {
                error!("[{:08x}] {:#}", session.id(), e);
            }
        }
    }
}

/// Process the pending response work of `session`.
pub(crate) fn process_work<M: DeviceMemoryMapper>(session: &mut Session<M>) {
    for work in session.work.take_all() {
        let id = session.id();
        match work.kind {
            WorkKind::InputPsc => match state::allow_input_psc(session.state) {
                Allow::Disallow => {
                    error!(
                        "[{:08x}] input port settings change in state {}",
                        id, session.state
                    );
                    session.report_error();
                }
                Allow::Defer => {
                    debug!(
                        "[{:08x}] deferring input port settings change in state {}",
                        id, session.state
                    );
                    session.work.park(work);
                }
                Allow::Discard | Allow::Ignore => {
                    warn!(
                        "[{:08x}] input port settings change discarded in state {}",
                        id, session.state
                    );
                    session.ipsc_properties_set = false;
                    session.psc_or_last_flag_discarded = true;
                }
                Allow::Allow => {
                    *session.subscription_mut(Port::Input) = Default::default();
                    process_bytes(session, &work.data);
                    match state::input_psc_target(session.state) {
                        Some(new_state) => session.set_state(new_state),
                        None => session.report_error(),
                    }
                }
            },
            WorkKind::OutputPsc => process_bytes(session, &work.data),
            WorkKind::LastFlag => {
                process_bytes(session, &work.data);
                if session.state == SessionState::Error {
                    continue;
                }
                match state::last_flag_target(session.state) {
                    Some(new_state) => session.set_state(new_state),
                    None => {
                        warn!("[{:08x}] last flag discarded in state {}", id, session.state);
                        session.psc_or_last_flag_discarded = true;
                    }
                }
            }
        }
    }
}

/// Apply the pending input port settings change, if any, before moving to `target`. Returns the
/// state to move to instead of `target`.
pub(crate) fn replay_input_psc<M: DeviceMemoryMapper>(
    session: &mut Session<M>,
    target: SessionState,
) -> SessionState {
    let Some(work) = session.work.take(WorkKind::InputPsc) else {
        return target;
    };

    debug!(
        "[{:08x}] replaying input port settings change in state {}",
        session.id(),
        session.state
    );
    *session.subscription_mut(Port::Input) = Default::default();
    process_bytes(session, &work.data);
    if session.state == SessionState::Error {
        return SessionState::Error;
    }

    state::after_input_psc_replay(session.state, target)
}

/// Drop the pending work of `kind`, if any.
pub(crate) fn discard_pending_work<M: DeviceMemoryMapper>(session: &mut Session<M>, kind: WorkKind) {
    let discarded = session.work.take_kind(kind).len();
    if discarded == 0 {
        return;
    }

    warn!(
        "[{:08x}] discarding {} pending {:?} work items",
        session.id(),
        discarded,
        kind
    );
    session.psc_or_last_flag_discarded = true;
    if kind == WorkKind::InputPsc {
        // Subscribe to the input port settings again on the next stream start.
        session.ipsc_properties_set = false;
    }
}

/// Process the pending last flag buffers, if any, without changing the session state.
pub(crate) fn flush_pending_last_flag<M: DeviceMemoryMapper>(session: &mut Session<M>) {
    for work in session.work.take_kind(WorkKind::LastFlag) {
        debug!("[{:08x}] flushing pending last flag buffer", session.id());
        process_bytes(session, &work.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDescriptor;
    use crate::buffer::BufferFlags;
    use crate::buffer::BufferInfo;
    use crate::mapping::MemoryHandle;
    use crate::mapping::Region;
    use crate::packet::CommandBuilder;
    use crate::packet::PacketIds;
    use crate::packet::Payload;
    use crate::session::Codec;
    use crate::session::SessionParams;

    struct TestMapper;

    impl DeviceMemoryMapper for TestMapper {
        fn map(&mut self, memory: MemoryHandle, _size: u64, _region: Region) -> Result<u64, i32> {
            Ok(memory.0 << 16)
        }

        fn unmap(&mut self, _device_addr: u64) -> Result<(), i32> {
            Ok(())
        }
    }

    fn decoder() -> Session<TestMapper> {
        Session::new(
            1,
            SessionParams::new(Domain::Decoder, Codec::H264),
            TestMapper,
        )
        .unwrap()
    }

    /// Put a buffer directly in the queued state, as if the firmware owned it.
    fn queued(session: &mut Session<TestMapper>, t: BufferType, index: u32, memory: u64) {
        let desc = BufferDescriptor {
            buffer_type: t,
            index,
            memory: MemoryHandle(memory),
            buffer_size: 0x1000,
            data_offset: 0,
            data_size: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
        };
        let addr = session
            .mappings
            .map(
                desc.memory,
                0x1000,
                Region::NonSecure,
                t == BufferType::Output,
            )
            .unwrap();
        let mut buf = crate::buffer::Buffer::from_descriptor(&desc);
        buf.device_addr = addr;
        buf.state = BufferState::Queued;
        session.buffers.get_mut(t).list.push(buf);
    }

    fn hfi_buffer(hfi_type: HfiBufferType, index: u32, memory: u64, flags: HfiBufferFlags) -> HfiBuffer {
        HfiBuffer {
            buffer_type: hfi_type as u32,
            index,
            base_address: memory << 16,
            buffer_size: 0x1000,
            data_size: 0x200,
            timestamp: 33,
            flags: flags.bits(),
            ..Default::default()
        }
    }

    /// A response made of the given packets.
    fn response(packets: &[(u32, FwFlags, HfiPort, Payload)]) -> Vec<u8> {
        let mut ids = PacketIds::default();
        let mut builder = CommandBuilder::new(&mut ids, 1, 4096);
        for (packet_type, _, port, payload) in packets {
            builder
                .packet(*packet_type, HostFlags::empty(), *port, *payload)
                .unwrap();
        }
        let mut bytes = builder.finish().unwrap();
        // Turn the host flags into firmware flags.
        let mut offset = HFI_HEADER_SIZE;
        for (_, flags, _, _) in packets {
            bytes[offset + 8..offset + 12].copy_from_slice(&flags.bits().to_le_bytes());
            let size = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            offset += size as usize;
        }
        bytes
    }

    fn buffer_done(port: HfiPort, buffer: HfiBuffer) -> (u32, FwFlags, HfiPort, Payload<'static>) {
        (
            HfiCommand::Buffer as u32,
            FwFlags::SUCCESS,
            port,
            Payload::Buffer(buffer),
        )
    }

    fn done_events(session: &mut Session<TestMapper>) -> Vec<BufferInfo> {
        session
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::BufferDone(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffer_done_is_reported_once() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Input, 0, 1);

        let bytes = response(&[buffer_done(
            HfiPort::Bitstream,
            hfi_buffer(HfiBufferType::Bitstream, 0, 1, HfiBufferFlags::empty()),
        )]);
        handle_session_response(&mut session, &bytes);
        let done = done_events(&mut session);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data_size, 0x200);
        assert!(session.buffers.get(BufferType::Input).list.is_empty());
        assert!(session.mappings.is_empty());

        // Same completion again.
        handle_session_response(&mut session, &bytes);
        assert!(done_events(&mut session).is_empty());
        assert_eq!(session.state(), SessionState::Start);
    }

    #[test]
    fn frame_info_applies_to_buffers() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Output, 2, 5);

        let bytes = response(&[
            buffer_done(
                HfiPort::Raw,
                hfi_buffer(HfiBufferType::Raw, 2, 5, HfiBufferFlags::empty()),
            ),
            (
                HfiProperty::PictureType as u32,
                FwFlags::SUCCESS,
                HfiPort::Raw,
                Payload::U32Enum(HfiPictureType::IDR.bits()),
            ),
            (
                HfiInformation::DataCorrupt as u32,
                FwFlags::INFORMATION,
                HfiPort::Raw,
                Payload::None,
            ),
        ]);
        handle_session_response(&mut session, &bytes);

        let done = done_events(&mut session);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].flags, BufferFlags::KEYFRAME | BufferFlags::ERROR);
        assert_eq!(done[0].timestamp, 33);
        // Frame information does not leak into the next response.
        assert_eq!(session.frame, crate::buffer::FrameInfo::default());
        // The delayed unmap reference is still there.
        assert_eq!(session.mappings.refcount(MemoryHandle(5)), 1);
    }

    #[test]
    fn read_only_output_is_retained() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Output, 0, 3);

        let ro = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(HfiBufferType::Raw, 0, 3, HfiBufferFlags::READ_ONLY),
        )]);
        handle_session_response(&mut session, &ro);
        assert!(done_events(&mut session).is_empty());
        assert_eq!(session.buffers.read_only.len(), 1);
        assert_eq!(
            session.buffers.get(BufferType::Output).list[0].state,
            BufferState::Retained
        );

        // Read-only again: still retained.
        handle_session_response(&mut session, &ro);
        assert!(done_events(&mut session).is_empty());

        let released = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(HfiBufferType::Raw, 0, 3, HfiBufferFlags::empty()),
        )]);
        handle_session_response(&mut session, &released);
        let done = done_events(&mut session);
        assert_eq!(done.len(), 1);
        assert!(!done[0].read_only);
        assert!(session.buffers.read_only.is_empty());
        assert!(session.buffers.get(BufferType::Output).list.is_empty());

        handle_session_response(&mut session, &released);
        assert!(done_events(&mut session).is_empty());
    }

    #[test]
    fn release_done_returns_retained_buffer() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Output, 1, 4);

        let ro = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(HfiBufferType::Raw, 1, 4, HfiBufferFlags::READ_ONLY),
        )]);
        handle_session_response(&mut session, &ro);
        session.buffers.dpb_list = Some(vec![]);
        let nonref = session.buffers.non_reference_buffers();
        assert_eq!(nonref.len(), 1);
        session.buffers.read_only[0].pending_release = true;

        let release_done = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(HfiBufferType::Raw, 1, 4, HfiBufferFlags::RELEASE_DONE),
        )]);
        handle_session_response(&mut session, &release_done);
        assert_eq!(done_events(&mut session).len(), 1);
        assert!(session.buffers.read_only.is_empty());
        assert!(session.mappings.is_empty());
    }

    #[test]
    fn last_flag_is_offloaded_and_stripped_when_not_allowed() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Output, 0, 6);

        let bytes = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(
                HfiBufferType::Raw,
                0,
                6,
                HfiBufferFlags::LAST | HfiBufferFlags::READ_ONLY,
            ),
        )]);
        handle_session_response(&mut session, &bytes);
        assert!(session.work.contains(WorkKind::LastFlag));
        assert!(done_events(&mut session).is_empty());

        process_work(&mut session);
        let done = done_events(&mut session);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data_size, 0);
        assert!(!done[0].flags.contains(BufferFlags::LAST));
        assert!(session.psc_or_last_flag_discarded);
        assert_eq!(session.state(), SessionState::Start);
        assert!(session.buffers.read_only.is_empty());
    }

    #[test]
    fn last_flag_moves_drain_forward() {
        let mut session = decoder();
        session.state = SessionState::Drain;
        queued(&mut session, BufferType::Output, 0, 6);

        let bytes = response(&[buffer_done(
            HfiPort::Raw,
            hfi_buffer(HfiBufferType::Raw, 0, 6, HfiBufferFlags::LAST),
        )]);
        handle_session_response(&mut session, &bytes);
        process_work(&mut session);

        let done = done_events(&mut session);
        assert_eq!(done.len(), 1);
        assert!(done[0].flags.contains(BufferFlags::LAST));
        assert_eq!(session.state(), SessionState::DrainLastFlag);
    }

    #[test]
    fn consecutive_last_flag_responses_are_all_processed() {
        let mut session = decoder();
        session.state = SessionState::Drain;
        queued(&mut session, BufferType::Output, 0, 6);
        queued(&mut session, BufferType::Output, 1, 7);

        for (index, memory) in [(0, 6), (1, 7)] {
            let bytes = response(&[buffer_done(
                HfiPort::Raw,
                hfi_buffer(HfiBufferType::Raw, index, memory, HfiBufferFlags::LAST),
            )]);
            handle_session_response(&mut session, &bytes);
        }
        assert_eq!(session.work.len(), 2);

        process_work(&mut session);
        let done = done_events(&mut session);
        assert_eq!(
            done.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        // Only the first one moves the drain forward.
        assert!(done[0].flags.contains(BufferFlags::LAST));
        assert!(!done[1].flags.contains(BufferFlags::LAST));
        assert_eq!(session.state(), SessionState::DrainLastFlag);
        assert!(session.buffers.get(BufferType::Output).list.is_empty());
        assert!(session.work.is_empty());
    }

    #[test]
    fn pending_last_flags_are_flushed() {
        let mut session = decoder();
        session.state = SessionState::Drain;
        queued(&mut session, BufferType::Output, 0, 6);
        queued(&mut session, BufferType::Output, 1, 7);

        for (index, memory) in [(0, 6), (1, 7)] {
            let bytes = response(&[buffer_done(
                HfiPort::Raw,
                hfi_buffer(HfiBufferType::Raw, index, memory, HfiBufferFlags::LAST),
            )]);
            handle_session_response(&mut session, &bytes);
        }

        flush_pending_last_flag(&mut session);
        assert_eq!(done_events(&mut session).len(), 2);
        assert_eq!(session.state(), SessionState::Drain);
        assert!(session.work.is_empty());
    }

    #[test]
    fn output_psc_is_offloaded() {
        let mut session = decoder();
        session.state = SessionState::Start;

        let opsc = response(&[
            (
                HfiProperty::BitstreamResolution as u32,
                FwFlags::SUCCESS,
                HfiPort::Raw,
                Payload::U32(0x0500_02d0),
            ),
            (
                HfiProperty::BufferFwMinOutputCount as u32,
                FwFlags::SUCCESS,
                HfiPort::Raw,
                Payload::U32(6),
            ),
            (
                HfiCommand::SettingsChange as u32,
                FwFlags::SUCCESS,
                HfiPort::Raw,
                Payload::None,
            ),
        ]);
        handle_session_response(&mut session, &opsc);
        assert!(session.work.contains(WorkKind::OutputPsc));
        assert!(session.take_events().is_empty());
        assert_eq!(session.subscription(Port::Output).bitstream_resolution, 0);

        // Two changes in a row are both delivered.
        handle_session_response(&mut session, &opsc);
        assert_eq!(session.work.len(), 2);

        process_work(&mut session);
        assert_eq!(
            session.take_events(),
            vec![
                SessionEvent::PortSettingsChange(Port::Output),
                SessionEvent::PortSettingsChange(Port::Output)
            ]
        );
        let params = session.subscription(Port::Output);
        assert_eq!(params.bitstream_resolution, 0x0500_02d0);
        assert_eq!(params.fw_min_count, 6);
        assert_eq!(session.subscription(Port::Input).bitstream_resolution, 0);
        assert_eq!(session.state(), SessionState::Start);
        assert!(session.work.is_empty());
    }

    #[test]
    fn input_psc_deferred_then_replayed() {
        let mut session = decoder();
        session.state = SessionState::Drain;

        let ipsc = response(&[
            (
                HfiProperty::BitstreamResolution as u32,
                FwFlags::SUCCESS,
                HfiPort::Bitstream,
                Payload::U32(0x0780_0438),
            ),
            (
                HfiCommand::SettingsChange as u32,
                FwFlags::SUCCESS,
                HfiPort::Bitstream,
                Payload::None,
            ),
        ]);

        handle_session_response(&mut session, &ipsc);
        process_work(&mut session);
        assert_eq!(session.state(), SessionState::DrcDrain);
        assert_eq!(
            session.subscription(Port::Input).bitstream_resolution,
            0x0780_0438
        );
        assert_eq!(
            session.take_events(),
            vec![SessionEvent::PortSettingsChange(Port::Input)]
        );

        // A second change is deferred while the first is being handled.
        handle_session_response(&mut session, &ipsc);
        process_work(&mut session);
        assert_eq!(session.state(), SessionState::DrcDrain);
        assert!(session.work.contains(WorkKind::InputPsc));
        assert!(session.take_events().is_empty());

        session.state = SessionState::DrcDrainLastFlag;
        let new_state = replay_input_psc(&mut session, SessionState::Drain);
        assert_eq!(new_state, SessionState::DrcDrain);
        assert!(!session.work.contains(WorkKind::InputPsc));
        assert_eq!(
            session.take_events(),
            vec![SessionEvent::PortSettingsChange(Port::Input)]
        );
    }

    #[test]
    fn input_psc_discarded_before_output_starts() {
        let mut session = decoder();
        session.state = SessionState::StartOutput;
        session.ipsc_properties_set = true;

        let ipsc = response(&[(
            HfiCommand::SettingsChange as u32,
            FwFlags::SUCCESS,
            HfiPort::Bitstream,
            Payload::None,
        )]);
        handle_session_response(&mut session, &ipsc);
        process_work(&mut session);

        assert!(!session.ipsc_properties_set);
        assert!(session.psc_or_last_flag_discarded);
        assert!(session.work.is_empty());
        assert!(session.take_events().is_empty());
    }

    #[test]
    fn session_error_flag_short_circuits() {
        let mut session = decoder();
        session.state = SessionState::Start;
        queued(&mut session, BufferType::Input, 0, 1);

        let bytes = response(&[
            buffer_done(
                HfiPort::Bitstream,
                hfi_buffer(HfiBufferType::Bitstream, 0, 1, HfiBufferFlags::empty()),
            ),
            (
                HfiSessionError::Fatal as u32,
                FwFlags::SESSION_ERROR,
                HfiPort::None,
                Payload::None,
            ),
        ]);
        handle_session_response(&mut session, &bytes);

        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.take_events(), vec![SessionEvent::Error]);
        assert_eq!(
            session.buffers.get(BufferType::Input).list[0].state,
            BufferState::Queued
        );
    }

    #[test]
    fn invalid_buffer_packets() {
        let mut session = decoder();
        session.state = SessionState::Start;

        // Raw buffers cannot come back on the bitstream port of a decoder.
        let bytes = response(&[buffer_done(
            HfiPort::Bitstream,
            hfi_buffer(HfiBufferType::Raw, 0, 1, HfiBufferFlags::empty()),
        )]);
        handle_session_response(&mut session, &bytes);
        assert_eq!(session.state(), SessionState::Error);

        // Unknown buffers are only logged.
        let mut session = decoder();
        session.state = SessionState::Start;
        let bytes = response(&[buffer_done(
            HfiPort::Bitstream,
            hfi_buffer(HfiBufferType::Bitstream, 9, 1, HfiBufferFlags::empty()),
        )]);
        handle_session_response(&mut session, &bytes);
        assert_eq!(session.state(), SessionState::Start);
        assert!(session.take_events().is_empty());
    }
}

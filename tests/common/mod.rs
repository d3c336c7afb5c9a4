// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process firmware emulator and test harness.
//!
//! The emulator consumes the command queue whenever the host rings the doorbell, and writes its
//! responses into the message queue. A background thread plays the role of the interrupt handler
//! by calling `Core::process_responses` and processing the offloaded work of every session.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use vidc_hfi::packet::parse_response;
use vidc_hfi::packet::CommandBuilder;
use vidc_hfi::packet::PacketIds;
use vidc_hfi::packet::Payload;
use vidc_hfi::protocol::*;
use vidc_hfi::queue::InterfaceQueues;
use vidc_hfi::shmem::HeapMemory;
use vidc_hfi::BufferDescriptor;
use vidc_hfi::BufferFlags;
use vidc_hfi::BufferInfo;
use vidc_hfi::BufferType;
use vidc_hfi::Codec;
use vidc_hfi::Core;
use vidc_hfi::CoreConfig;
use vidc_hfi::DeviceMemoryMapper;
use vidc_hfi::Domain;
use vidc_hfi::FirmwareDoorbell;
use vidc_hfi::HfiEventSink;
use vidc_hfi::MemoryHandle;
use vidc_hfi::Port;
use vidc_hfi::Region;
use vidc_hfi::SessionParams;

pub const FW_VERSION: &str = "video-fw-1.0";

/// A packet of a firmware response.
pub type FwPacket<'a> = (u32, FwFlags, HfiPort, Payload<'a>);

/// Build a firmware response from `packets`.
pub fn response(ids: &mut PacketIds, session_id: u32, packets: &[FwPacket]) -> Vec<u8> {
    let mut builder = CommandBuilder::new(ids, session_id, 4096);
    for (packet_type, _, port, payload) in packets {
        builder
            .packet(*packet_type, HostFlags::empty(), *port, *payload)
            .unwrap();
    }
    let mut bytes = builder.finish().unwrap();

    // Replace the host flags by the firmware ones.
    let mut offset = HFI_HEADER_SIZE;
    for (_, flags, _, _) in packets {
        bytes[offset + 8..offset + 12].copy_from_slice(&flags.bits().to_le_bytes());
        let size = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += size as usize;
    }

    bytes
}

fn string_payload(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(bytes.len().div_ceil(4) * 4 + 4, 0);
    bytes
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Firmware side of the interface queues.
pub struct Firmware {
    mem: HeapMemory,
    queues: Option<InterfaceQueues<HeapMemory>>,
    ids: PacketIds,
    /// Buffers currently owned by the firmware.
    queued: Vec<(u32, HfiPort, HfiBuffer)>,
    /// Every packet received, as (session id, packet type).
    pub received: Vec<(u32, u32)>,
    /// Do not acknowledge stop commands.
    pub ignore_stop: bool,
}

impl Firmware {
    pub fn new(mem: HeapMemory) -> Self {
        Self {
            mem,
            queues: None,
            ids: Default::default(),
            queued: Vec::new(),
            received: Vec::new(),
            ignore_stop: false,
        }
    }

    fn queues(&mut self) -> &InterfaceQueues<HeapMemory> {
        let mem = &self.mem;
        self.queues
            .get_or_insert_with(|| InterfaceQueues::attach(mem.clone(), 16 * 1024).unwrap())
    }

    /// Write a response made of `packets` into the message queue.
    pub fn send(&mut self, session_id: u32, packets: &[FwPacket]) {
        let bytes = response(&mut self.ids, session_id, packets);
        self.queues().write(HfiQueueType::Message, &bytes).unwrap();
    }

    fn ack(&mut self, session_id: u32, cmd: HfiCommand, port: HfiPort) {
        self.send(
            session_id,
            &[(cmd as u32, FwFlags::SUCCESS, port, Payload::None)],
        );
    }

    /// Buffers of session `session_id` owned by the firmware on `port`.
    pub fn queued(&self, session_id: u32, port: HfiPort) -> Vec<HfiBuffer> {
        self.queued
            .iter()
            .filter(|(s, p, _)| *s == session_id && *p == port)
            .map(|(_, _, b)| *b)
            .collect()
    }

    /// Give `buffer` back to the host.
    pub fn return_buffer(&mut self, session_id: u32, port: HfiPort, buffer: HfiBuffer) {
        self.queued.retain(|(s, p, b)| {
            !(*s == session_id
                && *p == port
                && b.index == buffer.index
                && b.base_address == buffer.base_address)
        });
        self.send(
            session_id,
            &[(
                HfiCommand::Buffer as u32,
                FwFlags::SUCCESS,
                port,
                Payload::Buffer(buffer),
            )],
        );
    }

    /// Consume and answer all the pending commands.
    pub fn process_commands(&mut self) {
        let mut command = Vec::new();
        while self
            .queues()
            .read(HfiQueueType::Command, &mut command)
            .is_ok()
        {
            self.handle_command(&command);
        }
    }

    fn handle_command(&mut self, bytes: &[u8]) {
        let command = parse_response(bytes).unwrap();
        let session_id = command.header.session_id;

        for pkt in &command.packets {
            self.received.push((session_id, pkt.packet_type()));
            let port = pkt.port().unwrap_or_default();

            if pkt.packet_type() == HfiProperty::ImageVersion as u32 {
                let version = string_payload(FW_VERSION);
                self.send(
                    0,
                    &[(
                        HfiProperty::ImageVersion as u32,
                        FwFlags::SUCCESS,
                        HfiPort::None,
                        Payload::U32Array(&version),
                    )],
                );
                continue;
            }

            match HfiCommand::n(pkt.packet_type()) {
                Some(HfiCommand::Init) => self.ack(0, HfiCommand::Init, HfiPort::None),
                Some(HfiCommand::Buffer) => {
                    let buffer = pkt.buffer().unwrap();
                    if buffer.buffer_flags().contains(HfiBufferFlags::RELEASE) {
                        let mut released = buffer;
                        released.flags = HfiBufferFlags::RELEASE_DONE.bits();
                        self.queued.retain(|(s, _, b)| {
                            !(*s == session_id && b.base_address == buffer.base_address)
                        });
                        self.return_buffer(session_id, port, released);
                    } else {
                        self.queued.push((session_id, port, buffer));
                    }
                }
                Some(HfiCommand::Stop) => {
                    if self.ignore_stop {
                        continue;
                    }
                    let returned = self.queued(session_id, port);
                    for mut buffer in returned {
                        buffer.data_size = 0;
                        self.return_buffer(session_id, port, buffer);
                    }
                    self.ack(session_id, HfiCommand::Stop, port);
                }
                Some(
                    cmd @ (HfiCommand::Open
                    | HfiCommand::Close
                    | HfiCommand::Start
                    | HfiCommand::Drain
                    | HfiCommand::Resume
                    | HfiCommand::SubscribeMode
                    | HfiCommand::DeliveryMode),
                ) => self.ack(session_id, cmd, port),
                _ => (),
            }
        }
    }

    /// Whether a packet of `packet_type` has been received for `session_id`.
    pub fn has_received(&self, session_id: u32, packet_type: u32) -> bool {
        self.received
            .iter()
            .any(|(s, t)| *s == session_id && *t == packet_type)
    }
}

/// Rings the emulated firmware, which answers right away.
pub struct FwDoorbell(Arc<Mutex<Firmware>>);

impl FirmwareDoorbell for FwDoorbell {
    fn raise_interrupt(&self) {
        self.0.lock().unwrap().process_commands();
    }
}

#[derive(Default)]
pub struct TestMapper {
    next: u64,
}

impl DeviceMemoryMapper for TestMapper {
    fn map(&mut self, memory: MemoryHandle, _size: u64, _region: Region) -> Result<u64, i32> {
        Ok(0x1000_0000 + memory.0 * 0x10_0000)
    }

    fn unmap(&mut self, _device_addr: u64) -> Result<(), i32> {
        Ok(())
    }

    fn allocate(&mut self, _size: u64, _region: Region) -> Result<MemoryHandle, i32> {
        self.next += 1;
        Ok(MemoryHandle(0x1000 + self.next))
    }

    fn free(&mut self, _memory: MemoryHandle) -> Result<(), i32> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BufferDone(u32, BufferInfo),
    PortSettingsChange(u32, Port),
    SessionError(u32),
    CoreError,
}

/// Records every notification of the core.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn buffers_done(&self, session_id: u32) -> Vec<BufferInfo> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::BufferDone(id, info) if id == session_id => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn session_errors(&self, session_id: u32) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Event::SessionError(session_id))
            .count()
    }

    pub fn core_errors(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Event::CoreError)
            .count()
    }
}

impl HfiEventSink for Recorder {
    fn on_buffer_done(&self, session_id: u32, buffer: &BufferInfo) {
        self.0
            .lock()
            .unwrap()
            .push(Event::BufferDone(session_id, *buffer));
    }

    fn on_port_settings_change(&self, session_id: u32, port: Port) {
        self.0
            .lock()
            .unwrap()
            .push(Event::PortSettingsChange(session_id, port));
    }

    fn on_session_error(&self, session_id: u32) {
        self.0.lock().unwrap().push(Event::SessionError(session_id));
    }

    fn on_core_error(&self) {
        self.0.lock().unwrap().push(Event::CoreError);
    }
}

pub type TestCore = Core<HeapMemory, TestMapper, Recorder>;

pub struct Harness {
    pub core: Arc<TestCore>,
    pub fw: Arc<Mutex<Firmware>>,
    pub events: Recorder,
    stop: Arc<AtomicBool>,
    irq: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CoreConfig {
            hw_response_timeout: Duration::from_millis(300),
            queue_size: 16 * 1024,
            ..Default::default()
        })
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let mem = HeapMemory::new(InterfaceQueues::<HeapMemory>::required_size(
            config.queue_size,
        ));
        let fw = Arc::new(Mutex::new(Firmware::new(mem.clone())));
        let events = Recorder::default();
        let core = Arc::new(
            Core::new(mem, config, events.clone())
                .unwrap()
                .with_doorbell(FwDoorbell(fw.clone())),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let irq = {
            let core = core.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    core.process_responses();
                    for id in core.session_ids() {
                        let _ = core.process_pending_work(id);
                    }
                    thread::sleep(Duration::from_micros(500));
                }
            })
        };

        Self {
            core,
            fw,
            events,
            stop,
            irq: Some(irq),
        }
    }

    pub fn open(&self, domain: Domain, codec: Codec) -> u32 {
        self.core
            .open_session(SessionParams::new(domain, codec), TestMapper::default())
            .unwrap()
    }

    /// Open a decoder and start streaming on both ports.
    pub fn streaming_decoder(&self) -> u32 {
        let id = self.open(Domain::Decoder, Codec::H264);
        self.core.streamon(id, Port::Input).unwrap();
        self.core.streamon(id, Port::Output).unwrap();
        id
    }

    pub fn queued(&self, session_id: u32, port: HfiPort) -> Vec<HfiBuffer> {
        self.fw.lock().unwrap().queued(session_id, port)
    }

    pub fn fw_send(&self, session_id: u32, packets: &[FwPacket]) {
        self.fw.lock().unwrap().send(session_id, packets);
    }

    pub fn return_buffer(&self, session_id: u32, port: HfiPort, buffer: HfiBuffer) {
        self.fw
            .lock()
            .unwrap()
            .return_buffer(session_id, port, buffer);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(irq) = self.irq.take() {
            let _ = irq.join();
        }
    }
}

pub fn descriptor(buffer_type: BufferType, index: u32, memory: u64) -> BufferDescriptor {
    BufferDescriptor {
        buffer_type,
        index,
        memory: MemoryHandle(memory),
        buffer_size: 0x10000,
        data_offset: 0,
        data_size: 0x800,
        timestamp: 1000 * index as u64,
        flags: BufferFlags::empty(),
    }
}

/// Poll `condition` until it holds, for at most two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Let the interrupt thread catch up with everything the firmware sent.
pub fn settle() {
    thread::sleep(Duration::from_millis(50));
}

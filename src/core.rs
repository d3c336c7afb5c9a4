// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The firmware core shared by all the sessions.
//!
//! [`Core`] owns the interface queues and the arena of sessions. Two kinds of locks are used: the
//! core lock guards the queues, the packet identifiers, the core state and the session arena,
//! while each session has its own lock guarding its state machine and buffers. When both are
//! needed the session lock is always taken first, and the core lock is never held while waiting
//! for the firmware.
//!
//! Responses are read from the message queue by [`Core::process_responses`], which the embedder
//! calls whenever the firmware raises an interrupt. Client notifications are delivered through
//! the [`HfiEventSink`] once the session lock has been released.

use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Instant;

use anyhow::Context;
use log::debug;
use log::error;
use log::info;
use log::warn;
use thiserror::Error;

use crate::buffer::BufferDescriptor;
use crate::buffer::BufferError;
use crate::config::CoreConfig;
use crate::mapping::MappingError;
use crate::packet;
use crate::packet::PacketError;
use crate::packet::PacketIds;
use crate::packet::Response;
use crate::protocol::*;
use crate::queue::InterfaceQueues;
use crate::queue::QueueError;
use crate::response;
use crate::session::Codec;
use crate::session::CommandSender;
use crate::session::Domain;
use crate::session::Port;
use crate::session::QueueOutcome;
use crate::session::Session;
use crate::session::SessionEvent;
use crate::session::SessionParams;
use crate::session::SubscriptionParams;
use crate::shmem::SharedMemory;
use crate::state::SessionState;
use crate::DeviceMemoryMapper;
use crate::FirmwareDoorbell;
use crate::HfiEventSink;
use crate::ResourceHooks;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("session {0:#x} not found")]
    NoSession(u32),
    #[error("maximum number of sessions reached")]
    TooManySessions,
    #[error("firmware core is not initialized")]
    CoreNotReady,
    #[error("sessions are still open")]
    SessionsOpen,
    #[error("timeout while waiting for {0}")]
    Timeout(&'static str),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("{0:?} is not supported for {1:?} sessions")]
    Unsupported(Codec, Domain),
    #[error("session {0:#x} is in error state")]
    SessionError(u32),
    #[error("{op} not allowed in state {state}")]
    NotAllowed {
        op: &'static str,
        state: SessionState,
    },
    #[error("{0} buffers not returned by the firmware")]
    BuffersNotReturned(usize),
    #[error("unknown buffer at {0:#x}")]
    UnknownBuffer(u64),
    #[error("invalid buffer type {0:#x}")]
    InvalidBufferType(u32),
    #[error("eventfd error: {0}")]
    EventFd(nix::Error),
    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl CoreError {
    /// Errno value to report to callers using errno-style interfaces.
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::NoSession(_) => libc::ENOENT,
            CoreError::TooManySessions | CoreError::SessionsOpen => libc::EBUSY,
            CoreError::CoreNotReady => libc::ENODATA,
            CoreError::Timeout(_) => libc::ETIMEDOUT,
            CoreError::Queue(QueueError::Full { .. }) => libc::ENOMEM,
            CoreError::Buffer(BufferError::Allocation(e)) => *e,
            CoreError::Buffer(BufferError::Mapping(MappingError::MappingFailure(e)))
            | CoreError::Mapping(MappingError::MappingFailure(e)) => *e,
            CoreError::NotAllowed { .. } => libc::EBUSY,
            CoreError::BuffersNotReturned(_) => libc::ENOTEMPTY,
            CoreError::EventFd(e) => *e as i32,
            CoreError::Io(_) => libc::EIO,
            CoreError::Queue(_)
            | CoreError::Packet(_)
            | CoreError::Buffer(_)
            | CoreError::Mapping(_)
            | CoreError::Unsupported(..)
            | CoreError::SessionError(_)
            | CoreError::UnknownBuffer(_)
            | CoreError::InvalidBufferType(_) => libc::EINVAL,
        }
    }
}

pub type HfiResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Deinit,
    /// Initialization command sent, waiting for the firmware to acknowledge it.
    InitWait,
    Init,
}

/// Session commands a client can issue besides streaming and buffer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Stop decoding or encoding once all the queued input has been processed.
    Drain,
    /// Resume after the last buffer of a drain or resolution change has been dequeued.
    Start,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionCell<M: DeviceMemoryMapper> {
    id: u32,
    /// Cleared once the session is being closed. Lookups never return dead sessions.
    alive: AtomicBool,
    session: Mutex<Session<M>>,
    /// Signaled every time a response has been applied to the session.
    cond: Condvar,
}

impl<M: DeviceMemoryMapper> SessionCell<M> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct CoreInner<S: SharedMemory, M: DeviceMemoryMapper> {
    state: CoreState,
    queues: InterfaceQueues<S>,
    ids: PacketIds,
    sessions: Vec<Arc<SessionCell<M>>>,
    next_session_id: u32,
    image_version: Option<String>,
}

impl<S: SharedMemory, M: DeviceMemoryMapper> CoreInner<S, M> {
    /// Write `command` into the command queue. Returns whether the firmware must be interrupted.
    fn write_command(&mut self, command: &[u8], dump: bool) -> HfiResult<bool> {
        if dump {
            packet::dump("cmd", command);
        }
        Ok(self.queues.write(HfiQueueType::Command, command)?)
    }

    /// Send the system initialization and the image version query.
    fn send_init(&mut self, max_size: usize, dump: bool) -> HfiResult<bool> {
        let init = packet::sys_init(&mut self.ids, max_size)?;
        let version = packet::sys_image_version(&mut self.ids, max_size)?;
        let irq = self.write_command(&init, dump)?;
        Ok(self.write_command(&version, dump)? || irq)
    }

    fn allocate_session_id(&mut self) -> u32 {
        loop {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
            if !self.sessions.iter().any(|s| s.id == id) {
                return id;
            }
        }
    }
}

pub struct Core<S, M, E>
where
    S: SharedMemory,
    M: DeviceMemoryMapper + Send,
    E: HfiEventSink + Send + Sync,
{
    config: CoreConfig,
    inner: Mutex<CoreInner<S, M>>,
    /// Signaled on core state changes.
    init_cond: Condvar,
    doorbell: Box<dyn FirmwareDoorbell + Send + Sync>,
    hooks: Box<dyn ResourceHooks + Send + Sync>,
    sink: E,
}

impl<S, M, E> Core<S, M, E>
where
    S: SharedMemory,
    M: DeviceMemoryMapper + Send,
    E: HfiEventSink + Send + Sync,
{
    /// Lay out the interface queues in `mem` and create a core in the `Deinit` state.
    pub fn new(mem: S, config: CoreConfig, sink: E) -> anyhow::Result<Self> {
        let queues = InterfaceQueues::new(mem, config.queue_size, config.huge_packet_size)
            .context("while setting up the interface queues")?;

        Ok(Self {
            inner: Mutex::new(CoreInner {
                state: CoreState::Deinit,
                queues,
                ids: Default::default(),
                sessions: Vec::new(),
                next_session_id: 1,
                image_version: None,
            }),
            config,
            init_cond: Condvar::new(),
            doorbell: Box::new(()),
            hooks: Box::new(()),
            sink,
        })
    }

    pub fn with_doorbell<D: FirmwareDoorbell + Send + Sync + 'static>(mut self, doorbell: D) -> Self {
        self.doorbell = Box::new(doorbell);
        self
    }

    pub fn with_hooks<H: ResourceHooks + Send + Sync + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> CoreState {
        lock(&self.inner).state
    }

    /// Firmware image version, as reported during initialization.
    pub fn image_version(&self) -> Option<String> {
        lock(&self.inner).image_version.clone()
    }

    /// Identifiers of the open sessions.
    pub fn session_ids(&self) -> Vec<u32> {
        lock(&self.inner)
            .sessions
            .iter()
            .filter(|s| s.is_alive())
            .map(|s| s.id)
            .collect()
    }

    /// Initialize the firmware core, if it is not already.
    pub fn init(&self) -> HfiResult<()> {
        let timeout = self.config.hw_response_timeout;
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);

        loop {
            match inner.state {
                CoreState::Init => return Ok(()),
                CoreState::Deinit => break,
                CoreState::InitWait => {
                    if Instant::now() >= deadline {
                        error!("timeout while waiting for another core initialization");
                        return Err(CoreError::Timeout("core init"));
                    }
                    debug!("core initialization in progress, waiting");
                    inner = self
                        .init_cond
                        .wait_timeout(inner, self.config.core_init_poll_interval)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        inner.state = CoreState::InitWait;
        let sent = inner.send_init(self.config.max_packet_size, self.config.dump_packets);
        drop(inner);

        match sent {
            Ok(true) => self.doorbell.raise_interrupt(),
            Ok(false) => (),
            Err(e) => {
                error!("failed to send core initialization: {:#}", e);
                self.force_deinit();
                return Err(e);
            }
        }

        let inner = self
            .init_cond
            .wait_timeout_while(lock(&self.inner), timeout, |i| {
                i.state == CoreState::InitWait
            })
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        match inner.state {
            CoreState::Init => Ok(()),
            CoreState::InitWait => {
                drop(inner);
                error!("timeout while waiting for core initialization");
                self.force_deinit();
                Err(CoreError::Timeout("core init"))
            }
            CoreState::Deinit => Err(CoreError::CoreNotReady),
        }
    }

    /// Move the core to the `Deinit` state.
    ///
    /// Unless `force` is set, this is refused while sessions are open. A forced deinit moves every
    /// session to the error state and reports a core error to the client.
    pub fn deinit(&self, force: bool) -> HfiResult<()> {
        let sessions = {
            let mut inner = lock(&self.inner);
            if inner.state == CoreState::Deinit {
                return Ok(());
            }
            if !force && !inner.sessions.is_empty() {
                warn!("refusing to deinit core with {} sessions", inner.sessions.len());
                return Err(CoreError::SessionsOpen);
            }
            inner.state = CoreState::Deinit;
            self.init_cond.notify_all();
            inner.sessions.clone()
        };
        info!("core deinit (forced: {})", force);

        for cell in sessions {
            let events = {
                let mut session = lock(&cell.session);
                session.report_error();
                session.abort_pending();
                cell.cond.notify_all();
                session.take_events()
            };
            self.deliver(cell.id, events);
        }
        if force {
            self.sink.on_core_error();
        }

        Ok(())
    }

    fn force_deinit(&self) {
        if let Err(e) = self.deinit(true) {
            error!("failed to deinit core: {:#}", e);
        }
    }

    fn find_session(&self, id: u32) -> HfiResult<Arc<SessionCell<M>>> {
        lock(&self.inner)
            .sessions
            .iter()
            .find(|s| s.id == id && s.is_alive())
            .cloned()
            .ok_or(CoreError::NoSession(id))
    }

    fn remove_session(&self, id: u32) {
        lock(&self.inner).sessions.retain(|s| s.id != id);
    }

    fn deliver(&self, id: u32, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::BufferDone(info) => self.sink.on_buffer_done(id, &info),
                SessionEvent::PortSettingsChange(port) => {
                    self.sink.on_port_settings_change(id, port)
                }
                SessionEvent::Error => self.sink.on_session_error(id),
            }
        }
    }

    /// Run `f` on session `id` with its lock held, then deliver the resulting notifications.
    fn with_session<T, F>(&self, id: u32, f: F) -> HfiResult<T>
    where
        F: FnOnce(&mut Session<M>) -> HfiResult<T>,
    {
        let cell = self.find_session(id)?;
        let (result, events) = {
            let mut session = lock(&cell.session);
            if !cell.is_alive() {
                return Err(CoreError::NoSession(id));
            }
            let result = f(&mut session);
            (result, session.take_events())
        };
        self.deliver(id, events);

        result
    }

    /// Open a new session, using `mapper` to map its buffers. Returns the session id.
    pub fn open_session(&self, params: SessionParams, mapper: M) -> HfiResult<u32> {
        self.init()?;

        let cell = {
            let mut inner = lock(&self.inner);
            if inner.sessions.len() >= self.config.max_sessions {
                error!("cannot open more than {} sessions", self.config.max_sessions);
                return Err(CoreError::TooManySessions);
            }
            let id = inner.allocate_session_id();
            let cell = Arc::new(SessionCell {
                id,
                alive: AtomicBool::new(true),
                session: Mutex::new(Session::new(id, params, mapper)?),
                cond: Condvar::new(),
            });
            inner.sessions.push(cell.clone());
            cell
        };

        let result = lock(&cell.session).open(self);
        if let Err(e) = result {
            error!("[{:08x}] failed to open session: {:#}", cell.id, e);
            cell.alive.store(false, Ordering::Release);
            self.remove_session(cell.id);
            return Err(e);
        }

        Ok(cell.id)
    }

    /// Close session `id` and release all its resources. Client buffers still owned by the
    /// session are returned through [`HfiEventSink::on_buffer_done`].
    pub fn close_session(&self, id: u32) -> HfiResult<()> {
        let cell = self.find_session(id)?;
        let mut session = lock(&cell.session);
        if !cell.is_alive() {
            return Err(CoreError::NoSession(id));
        }

        let mut result = Ok(());
        if session.close_begin(self) {
            session = cell
                .cond
                .wait_timeout_while(session, self.config.hw_response_timeout, |s| {
                    s.close_pending()
                })
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if session.close_pending() {
                error!("[{:08x}] timeout while waiting for close", id);
                session.report_error();
                result = Err(CoreError::Timeout("session close"));
            }
        }

        cell.alive.store(false, Ordering::Release);
        session.destroy();
        let events = session.take_events();
        drop(session);

        self.remove_session(id);
        self.deliver(id, events);
        info!("[{:08x}] session closed", id);

        if result.is_err() {
            self.force_deinit();
        }
        result
    }

    pub fn streamon(&self, id: u32, port: Port) -> HfiResult<()> {
        self.with_session(id, |session| session.streamon(self, self.hooks.as_ref(), port))
    }

    /// Stop streaming on `port`, waiting for the firmware to give back the buffers it owns.
    ///
    /// If the firmware does not acknowledge in time, the session is killed and the core torn
    /// down.
    pub fn streamoff(&self, id: u32, port: Port) -> HfiResult<()> {
        let cell = self.find_session(id)?;
        let mut session = lock(&cell.session);
        if !cell.is_alive() {
            return Err(CoreError::NoSession(id));
        }

        let mut timed_out = false;
        let result = match session.streamoff_begin(self, port) {
            Ok(true) => {
                session = cell
                    .cond
                    .wait_timeout_while(session, self.config.hw_response_timeout, |s| {
                        s.stop_pending(port)
                    })
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                let stopped = if session.stop_pending(port) {
                    error!("[{:08x}] timeout while waiting for stop({:?})", id, port);
                    timed_out = true;
                    Err(CoreError::Timeout("stop"))
                } else if session.state() == SessionState::Error {
                    Err(CoreError::SessionError(id))
                } else {
                    Ok(())
                };
                let result = session.streamoff_complete(port, stopped);
                if timed_out {
                    session.kill(self);
                }
                result
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        let events = session.take_events();
        drop(session);

        self.deliver(id, events);
        if timed_out {
            self.force_deinit();
        }
        result
    }

    pub fn queue_buffer(&self, id: u32, desc: &BufferDescriptor) -> HfiResult<QueueOutcome> {
        self.with_session(id, |session| {
            session.queue_buffer(self, self.hooks.as_ref(), desc)
        })
    }

    pub fn command(&self, id: u32, command: SessionCommand) -> HfiResult<()> {
        self.with_session(id, |session| match command {
            SessionCommand::Drain => session.drain(self),
            SessionCommand::Start => session.resume(self, self.hooks.as_ref()),
        })
    }

    pub fn session_state(&self, id: u32) -> HfiResult<SessionState> {
        self.with_session(id, |session| Ok(session.state()))
    }

    /// Stream parameters last reported by the firmware for `port` of session `id`.
    pub fn subscription(&self, id: u32, port: Port) -> HfiResult<SubscriptionParams> {
        self.with_session(id, |session| Ok(*session.subscription(port)))
    }

    /// FD becoming readable when session `id` has offloaded response work to process with
    /// [`Self::process_pending_work`].
    pub fn work_fd(&self, id: u32) -> HfiResult<OwnedFd> {
        self.with_session(id, |session| {
            session
                .as_fd()
                .try_clone_to_owned()
                .map_err(|e| CoreError::Io(e.kind()))
        })
    }

    /// Process the offloaded response work of session `id` that its state allows.
    pub fn process_pending_work(&self, id: u32) -> HfiResult<()> {
        let cell = self.find_session(id)?;
        let events = {
            let mut session = lock(&cell.session);
            if !cell.is_alive() {
                return Err(CoreError::NoSession(id));
            }
            response::process_work(&mut session);
            cell.cond.notify_all();
            session.take_events()
        };
        self.deliver(id, events);

        Ok(())
    }

    /// Read and handle all the pending firmware messages, then log the firmware debug messages.
    pub fn process_responses(&self) {
        let mut message = Vec::new();
        loop {
            let read = lock(&self.inner)
                .queues
                .read(HfiQueueType::Message, &mut message);
            match read {
                Ok(irq) => {
                    if irq {
                        self.doorbell.raise_interrupt();
                    }
                    self.handle_response(&message);
                }
                Err(QueueError::Empty) => break,
                Err(e @ QueueError::Corrupt { .. }) => {
                    error!("message queue resynchronized: {:#}", e);
                }
                Err(e) => {
                    error!("error while reading message queue: {:#}", e);
                    break;
                }
            }
        }

        self.drain_debug_queue();
    }

    fn drain_debug_queue(&self) {
        let mut message = Vec::new();
        loop {
            match lock(&self.inner)
                .queues
                .read(HfiQueueType::Debug, &mut message)
            {
                Ok(_) => {
                    let text = String::from_utf8_lossy(message.get(4..).unwrap_or_default());
                    debug!("firmware: {}", text.trim_end_matches('\0').trim_end());
                }
                Err(QueueError::Empty) => break,
                Err(e) => {
                    warn!("error while reading debug queue: {:#}", e);
                    break;
                }
            }
        }
    }

    fn handle_response(&self, bytes: &[u8]) {
        if self.config.dump_packets {
            packet::dump("msg", bytes);
        }

        let response = match packet::parse_response(bytes) {
            Ok(response) => response,
            Err(e) => {
                error!("invalid response from firmware: {:#}", e);
                self.force_deinit();
                return;
            }
        };

        let system_error = response.packets.iter().any(|p| {
            HFI_SYSTEM_ERROR_RANGE.contains(p.packet_type())
                || p.flags().contains(FwFlags::SYSTEM_ERROR)
        });
        if system_error {
            error!(
                "system error reported by firmware for session {:#x}",
                response.header.session_id
            );
            self.force_deinit();
            return;
        }

        let id = response.header.session_id;
        if id == 0 {
            self.handle_system_response(&response);
            return;
        }

        let cell = match self.find_session(id) {
            Ok(cell) => cell,
            Err(e) => {
                warn!("dropping response: {:#}", e);
                return;
            }
        };
        let events = {
            let mut session = lock(&cell.session);
            response::handle_session_response(&mut session, bytes);
            cell.cond.notify_all();
            session.take_events()
        };
        self.deliver(id, events);
    }

    fn handle_system_response(&self, response: &Response) {
        let mut inner = lock(&self.inner);
        for pkt in &response.packets {
            match pkt.packet_type() {
                t if t == HfiCommand::Init as u32 => {
                    if inner.state == CoreState::InitWait {
                        inner.state = CoreState::Init;
                        self.init_cond.notify_all();
                        info!("core initialized");
                    } else {
                        warn!("unexpected init done in state {:?}", inner.state);
                    }
                }
                t if t == HfiProperty::ImageVersion as u32 => {
                    let version = pkt.string();
                    info!("firmware image version: {}", version);
                    inner.image_version = Some(version);
                }
                t => debug!("ignoring system packet {}", PacketTypeName(t)),
            }
        }
    }
}

impl<S, M, E> CommandSender for Core<S, M, E>
where
    S: SharedMemory,
    M: DeviceMemoryMapper + Send,
    E: HfiEventSink + Send + Sync,
{
    fn send<F>(&self, build: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut PacketIds, usize) -> Result<Vec<u8>, PacketError>,
    {
        let irq = {
            let mut inner = lock(&self.inner);
            if inner.state != CoreState::Init {
                return Err(CoreError::CoreNotReady);
            }
            let command = build(&mut inner.ids, self.config.max_packet_size)?;
            inner.write_command(&command, self.config.dump_packets)?
        };
        if irq {
            self.doorbell.raise_interrupt();
        }

        Ok(())
    }
}

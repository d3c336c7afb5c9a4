// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the Host-Firmware Interface (HFI) of a video codec accelerator.
//!
//! This crate implements the transport, session state machine and buffer tracking needed to drive
//! a video decoding or encoding firmware through shared-memory ring queues. It is independent of
//! the platform it runs on: a handful of traits must be implemented by the embedder to make the
//! firmware reachable.
//!
//! # Traits to implement by the embedder
//!
//! * Client buffers are identified by opaque [`mapping::MemoryHandle`]s, which a
//!   [`DeviceMemoryMapper`] maps into the device address space. Each session gets its own mapper.
//! * The firmware is notified of new commands through a [`FirmwareDoorbell`].
//! * Power scaling and sizing of the firmware scratch buffers are provided by
//!   [`ResourceHooks`].
//! * Completed buffers, port settings changes and errors are reported to an [`HfiEventSink`].
//!
//! # Anatomy of the driver
//!
//! [`Core`] lays out the interface queues in a [`shmem::SharedMemory`] region and owns all the
//! sessions. Clients open sessions, start streaming on their ports, and queue buffers using the
//! methods of [`Core`]. The embedder calls [`Core::process_responses`] whenever the firmware
//! raises an interrupt, and [`Core::process_pending_work`] whenever the FD returned by
//! [`Core::work_fd`] for a session signals.

pub mod buffer;
pub mod config;
pub mod core;
pub mod io;
pub mod mapping;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod response;
pub mod session;
pub mod shmem;
pub mod state;
pub mod work;

pub use crate::buffer::BufferDescriptor;
pub use crate::buffer::BufferFlags;
pub use crate::buffer::BufferInfo;
pub use crate::buffer::BufferType;
pub use crate::config::CoreConfig;
pub use crate::core::Core;
pub use crate::core::CoreError;
pub use crate::core::CoreState;
pub use crate::core::HfiResult;
pub use crate::core::SessionCommand;
pub use crate::mapping::MemoryHandle;
pub use crate::mapping::Region;
pub use crate::session::Codec;
pub use crate::session::Domain;
pub use crate::session::Port;
pub use crate::session::QueueOutcome;
pub use crate::session::SessionParams;
pub use crate::state::SessionState;

/// Maps memory backing client and internal buffers into the address space of the device.
pub trait DeviceMemoryMapper {
    /// Maps `size` bytes of `memory` into `region`.
    ///
    /// Returns the device address of the mapping on success, or a `libc` error code in case of
    /// failure.
    fn map(&mut self, memory: MemoryHandle, size: u64, region: Region) -> Result<u64, i32>;

    /// Removes the mapping at `device_addr`.
    fn unmap(&mut self, device_addr: u64) -> Result<(), i32>;

    /// Allocates `size` bytes of memory suitable for `region`, for the firmware scratch buffers.
    fn allocate(&mut self, _size: u64, _region: Region) -> Result<MemoryHandle, i32> {
        Err(libc::ENOTTY)
    }

    /// Frees memory previously returned by `allocate`.
    fn free(&mut self, _memory: MemoryHandle) -> Result<(), i32> {
        Err(libc::ENOTTY)
    }
}

/// For cases where device memory mapping is not supported.
impl DeviceMemoryMapper for () {
    fn map(&mut self, _: MemoryHandle, _: u64, _: Region) -> Result<u64, i32> {
        Err(libc::ENOTTY)
    }

    fn unmap(&mut self, _: u64) -> Result<(), i32> {
        Err(libc::ENOTTY)
    }
}

/// Receiver of the notifications of a [`Core`].
///
/// Methods are called without any lock held, possibly from the thread processing firmware
/// responses.
pub trait HfiEventSink {
    /// `buffer` has been given back to the client.
    fn on_buffer_done(&self, _session_id: u32, _buffer: &BufferInfo) {}

    /// The firmware changed the stream parameters of `port`.
    fn on_port_settings_change(&self, _session_id: u32, _port: Port) {}

    /// The session is in error state and can only be closed. Called at most once per session.
    fn on_session_error(&self, _session_id: u32) {}

    /// The firmware core has been torn down after a fatal error.
    fn on_core_error(&self) {}
}

impl HfiEventSink for () {}

/// Notifies the firmware that new commands are available.
pub trait FirmwareDoorbell {
    fn raise_interrupt(&self);
}

impl FirmwareDoorbell for () {
    fn raise_interrupt(&self) {}
}

/// Platform services consumed by sessions.
pub trait ResourceHooks {
    /// Re-evaluate clocks and bandwidth before work is submitted for `session_id`.
    fn scale_power(&self, _session_id: u32) {}

    /// Size in bytes and count of the internal buffers of type `t` needed by `session_id`.
    fn internal_buffer_requirements(&self, _session_id: u32, _t: BufferType) -> (u32, u32) {
        (0, 0)
    }
}

impl ResourceHooks for () {}

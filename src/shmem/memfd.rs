// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared memory backed by a sealed `memfd`, which can be handed to a firmware emulator running
//! in another process.

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;

use super::SharedMemory;

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("shared memory size must be a non-zero multiple of 4, got {0}")]
    InvalidSize(usize),
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
    #[error("failed to query size of memfd: {0}")]
    FailedToStat(io::Error),
    #[error("mmap call returned error: {0}")]
    Mmap(Errno),
}

/// A `memfd` mapped read-write into the address space of the host.
pub struct MemFdRegion {
    file: File,
    data: NonNull<u32>,
    num_words: usize,
}

// SAFETY: the mapping is only accessed through volatile word accesses, and stays valid for as
// long as the region exists.
unsafe impl Send for MemFdRegion {}
// SAFETY: see above.
unsafe impl Sync for MemFdRegion {}

impl MemFdRegion {
    /// Create a new zeroed region of `size` bytes.
    pub fn new(size: usize) -> Result<Self, ShmemError> {
        if size == 0 || size % 4 != 0 {
            return Err(ShmemError::InvalidSize(size));
        }

        let fd = memfd_create(c"vidc-hfi-queues", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();
        file.set_len(size as u64)
            .map_err(ShmemError::FailedToSetSize)?;

        // Seal so the memory size cannot be changed by the peer.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(ShmemError::FailedToSeal(io::Error::last_os_error()));
        }

        Self::map(file, size)
    }

    /// Map a region previously created by [`Self::new`], typically in another process.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, ShmemError> {
        let file: File = fd.into();
        let size = file
            .metadata()
            .map_err(ShmemError::FailedToStat)?
            .len() as usize;
        if size == 0 || size % 4 != 0 {
            return Err(ShmemError::InvalidSize(size));
        }

        Self::map(file, size)
    }

    fn map(file: File, size: usize) -> Result<Self, ShmemError> {
        let len = NonZeroUsize::new(size).ok_or(ShmemError::InvalidSize(size))?;

        // SAFETY: `file` is a valid file of at least `size` bytes.
        let data = unsafe {
            mman::mmap(
                None,
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(ShmemError::Mmap)?;

        Ok(Self {
            file,
            data: data.cast(),
            num_words: size / 4,
        })
    }

    /// Duplicate the file descriptor of the region so it can be sent to the peer.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.file.as_fd().try_clone_to_owned()
    }
}

impl SharedMemory for MemFdRegion {
    fn num_words(&self) -> usize {
        self.num_words
    }

    fn load(&self, index: usize) -> u32 {
        assert!(index < self.num_words, "shared memory index out of bounds");
        // SAFETY: `index` is within the mapping, which is page-aligned.
        u32::from_le(unsafe { self.data.as_ptr().add(index).read_volatile() })
    }

    fn store(&self, index: usize, value: u32) {
        assert!(index < self.num_words, "shared memory index out of bounds");
        // SAFETY: `index` is within the mapping, which is page-aligned.
        unsafe { self.data.as_ptr().add(index).write_volatile(value.to_le()) }
    }
}

impl AsFd for MemFdRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for MemFdRegion {
    fn drop(&mut self) {
        // SAFETY: the pointer and length were obtained from mmap() and are still valid.
        unsafe { mman::munmap(self.data.cast(), self.num_words * 4) }.unwrap_or_else(|e| {
            log::error!("error while unmapping shared memory: {:#}", e);
        });
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Refcounted device-address mappings of buffer memory.
//!
//! Buffers sharing the same backing memory share a single mapping, which is only removed from
//! the device address space once every user has released it. Decoder output buffers take one
//! extra reference at creation time (the "delayed unmap" reference), which is only dropped once
//! the driver knows the firmware does not use the memory anymore.

use thiserror::Error;

use crate::DeviceMemoryMapper;

/// Identity of a piece of memory provided by a client or allocated for the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

/// Device address space region into which a buffer is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    NonSecure,
    SecurePixel,
    SecureNonPixel,
    SecureBitstream,
}

#[derive(Debug, PartialEq, Eq)]
struct Mapping {
    memory: MemoryHandle,
    region: Region,
    size: u64,
    /// Device address at which the memory is currently mapped.
    device_addr: u64,
    /// Number of users of this mapping, including the delayed unmap reference.
    refcount: usize,
    /// Whether the delayed unmap reference is still held.
    delayed_unmap: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("error while mapping memory: {0}")]
    MappingFailure(i32),
    #[error("memory {0:?} is not mapped")]
    NotMapped(MemoryHandle),
    #[error("memory {0:?} has no delayed unmap reference")]
    NoDelayedUnmap(MemoryHandle),
    #[error("memory already mapped in region {existing:?}, requested {requested:?}")]
    RegionMismatch { existing: Region, requested: Region },
}

/// Mappings of one session, using a device memory mapper.
pub struct MappingManager<M: DeviceMemoryMapper> {
    mappings: Vec<Mapping>,
    mapper: M,
}

impl<M: DeviceMemoryMapper> From<M> for MappingManager<M> {
    fn from(mapper: M) -> Self {
        Self {
            mappings: Vec::new(),
            mapper,
        }
    }
}

impl<M: DeviceMemoryMapper> MappingManager<M> {
    fn find(&self, memory: MemoryHandle) -> Option<usize> {
        self.mappings.iter().position(|m| m.memory == memory)
    }

    /// Map `size` bytes of `memory` into `region`, or take a new reference to its existing
    /// mapping. Returns the device address of the mapping.
    ///
    /// If `delayed_unmap` is set and the memory was not mapped yet, an extra reference is taken
    /// which can only be released using [`Self::put_delayed_unmap`] or
    /// [`Self::unmap_completely`].
    pub fn map(
        &mut self,
        memory: MemoryHandle,
        size: u64,
        region: Region,
        delayed_unmap: bool,
    ) -> Result<u64, MappingError> {
        if let Some(i) = self.find(memory) {
            let mapping = &mut self.mappings[i];
            if mapping.region != region {
                return Err(MappingError::RegionMismatch {
                    existing: mapping.region,
                    requested: region,
                });
            }
            mapping.refcount += 1;
            return Ok(mapping.device_addr);
        }

        let device_addr = self
            .mapper
            .map(memory, size, region)
            .map_err(MappingError::MappingFailure)?;
        self.mappings.push(Mapping {
            memory,
            region,
            size,
            device_addr,
            refcount: if delayed_unmap { 2 } else { 1 },
            delayed_unmap,
        });

        Ok(device_addr)
    }

    fn drop_reference(&mut self, index: usize) -> bool {
        let mapping = &mut self.mappings[index];
        mapping.refcount = mapping.refcount.saturating_sub(1);
        if mapping.refcount > 0 {
            return true;
        }

        if let Err(e) = self.mapper.unmap(mapping.device_addr) {
            log::error!(
                "error while unmapping memory {:?} at {:#x}: {:#}",
                mapping.memory,
                mapping.device_addr,
                e
            );
        }
        self.mappings.remove(index);
        false
    }

    /// Drop one reference to the mapping of `memory`.
    ///
    /// Returns `true` if the memory is still mapped, `false` if this was the last reference.
    pub fn unmap(&mut self, memory: MemoryHandle) -> Result<bool, MappingError> {
        let index = self.find(memory).ok_or(MappingError::NotMapped(memory))?;
        Ok(self.drop_reference(index))
    }

    /// Drop the delayed unmap reference of `memory`.
    ///
    /// Returns `true` if the memory is still mapped, `false` if this was the last reference.
    pub fn put_delayed_unmap(&mut self, memory: MemoryHandle) -> Result<bool, MappingError> {
        let index = self.find(memory).ok_or(MappingError::NotMapped(memory))?;
        let mapping = &mut self.mappings[index];
        if !mapping.delayed_unmap {
            return Err(MappingError::NoDelayedUnmap(memory));
        }
        mapping.delayed_unmap = false;
        Ok(self.drop_reference(index))
    }

    /// Remove the mapping of `memory` regardless of its reference count.
    pub fn unmap_completely(&mut self, memory: MemoryHandle) -> Result<(), MappingError> {
        let index = self.find(memory).ok_or(MappingError::NotMapped(memory))?;
        self.mappings[index].refcount = 1;
        self.drop_reference(index);
        Ok(())
    }

    /// Remove all the mappings.
    pub fn unmap_all(&mut self) {
        while let Some(mapping) = self.mappings.first() {
            let memory = mapping.memory;
            let _ = self.unmap_completely(memory);
        }
    }

    /// Returns the device address of `memory`, if it is mapped.
    pub fn device_addr(&self, memory: MemoryHandle) -> Option<u64> {
        self.find(memory).map(|i| self.mappings[i].device_addr)
    }

    /// Returns the memory mapped at `device_addr`, if any.
    pub fn memory_at(&self, device_addr: u64) -> Option<MemoryHandle> {
        self.mappings
            .iter()
            .find(|m| m.device_addr == device_addr)
            .map(|m| m.memory)
    }

    /// Returns the number of references to the mapping of `memory`.
    pub fn refcount(&self, memory: MemoryHandle) -> usize {
        self.find(memory).map_or(0, |i| self.mappings[i].refcount)
    }

    /// Returns the memory of all the mappings still holding their delayed unmap reference, along
    /// with their reference count.
    pub fn delayed_mappings(&self) -> Vec<(MemoryHandle, usize)> {
        self.mappings
            .iter()
            .filter(|m| m.delayed_unmap)
            .map(|m| (m.memory, m.refcount))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Returns the size of the mapping of `memory`.
    pub fn size(&self, memory: MemoryHandle) -> Option<u64> {
        self.find(memory).map(|i| self.mappings[i].size)
    }

    pub fn mapper_mut(&mut self) -> &mut M {
        &mut self.mapper
    }

    /// Consume the mapping manager and return the mapper it has been constructed from.
    pub fn into_mapper(self) -> M {
        self.mapper
    }
}

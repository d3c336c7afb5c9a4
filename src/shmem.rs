// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory regions shared between the host and the firmware.
//!
//! The interface queues only ever access shared memory as aligned 32-bit little-endian words, so
//! this is the only access granularity offered by [`SharedMemory`]. Ordering between accesses is
//! the responsibility of the caller, which must issue the appropriate fences.

pub mod memfd;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use memfd::MemFdRegion;

/// A region of memory visible to both the host and the firmware.
pub trait SharedMemory: Send + Sync {
    /// Size of the region, in 32-bit words.
    fn num_words(&self) -> usize;
    /// Reads the word at `index`. Panics if `index` is out of bounds.
    fn load(&self, index: usize) -> u32;
    /// Writes `value` at word `index`. Panics if `index` is out of bounds.
    fn store(&self, index: usize, value: u32);
}

/// Shared memory allocated on the heap. Clones refer to the same memory, which makes this type
/// suitable for running the firmware side of the protocol in the same process.
#[derive(Clone)]
pub struct HeapMemory {
    words: Arc<[AtomicU32]>,
}

impl HeapMemory {
    /// Allocate a zeroed region of at least `size` bytes.
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }
}

impl SharedMemory for HeapMemory {
    fn num_words(&self) -> usize {
        self.words.len()
    }

    fn load(&self, index: usize) -> u32 {
        u32::from_le(self.words[index].load(Ordering::Relaxed))
    }

    fn store(&self, index: usize, value: u32) {
        self.words[index].store(value.to_le(), Ordering::Relaxed)
    }
}

impl<S: SharedMemory + ?Sized> SharedMemory for Arc<S> {
    fn num_words(&self) -> usize {
        (**self).num_words()
    }

    fn load(&self, index: usize) -> u32 {
        (**self).load(index)
    }

    fn store(&self, index: usize, value: u32) {
        (**self).store(index, value)
    }
}

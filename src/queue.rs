// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface queues shared between the host and the firmware.
//!
//! The shared region starts with a queue table header, followed by the headers of the command,
//! message and debug queues, and then by the ring arrays of each queue. All indices stored in the
//! queue headers count 32-bit words, and each side only ever moves the index it owns: the
//! producer moves `write_idx`, the consumer moves `read_idx`.
//!
//! Packets are framed by their first word, which contains the size of the packet in bytes.

use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::protocol::HfiQueueType;
use crate::shmem::SharedMemory;

/// Number of queues in the table.
pub const NUM_QUEUES: usize = 3;

const TABLE_VERSION: u32 = 0;
const TABLE_HEADER_WORDS: usize = 6;
const QUEUE_HEADER_WORDS: usize = 14;
const ARRAYS_START_WORD: usize = TABLE_HEADER_WORDS + NUM_QUEUES * QUEUE_HEADER_WORDS;

// Word offsets of the queue table header fields.
const TBL_VERSION: usize = 0;
const TBL_SIZE: usize = 1;
const TBL_QHDR0_OFFSET: usize = 2;
const TBL_QHDR_SIZE: usize = 3;
const TBL_NUM_Q: usize = 4;
const TBL_NUM_ACTIVE_Q: usize = 5;

// Word offsets of the queue header fields.
const QHDR_STATUS: usize = 0;
const QHDR_START_ADDR: usize = 1;
const QHDR_TYPE: usize = 2;
const QHDR_Q_SIZE: usize = 3;
const QHDR_PKT_SIZE: usize = 4;
const QHDR_PKT_DROP_CNT: usize = 5;
const QHDR_RX_WM: usize = 6;
const QHDR_TX_WM: usize = 7;
const QHDR_RX_REQ: usize = 8;
const QHDR_TX_REQ: usize = 9;
const QHDR_RX_IRQ_STATUS: usize = 10;
const QHDR_TX_IRQ_STATUS: usize = 11;
const QHDR_READ_IDX: usize = 12;
const QHDR_WRITE_IDX: usize = 13;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue size {0} must be a non-zero multiple of 4")]
    InvalidQueueSize(usize),
    #[error("shared region too small: {needed} words needed, {available} available")]
    RegionTooSmall { needed: usize, available: usize },
    #[error("shared region does not contain a valid queue table")]
    InvalidTable,
    #[error("invalid packet size {0}")]
    InvalidPacketSize(u32),
    #[error("queue full: {free} free words, {needed} needed")]
    Full { free: usize, needed: usize },
    #[error("queue empty")]
    Empty,
    #[error("corrupt queue: read index {read_idx}, packet size {size} words")]
    Corrupt { read_idx: u32, size: u32 },
}

/// Snapshot of the header of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueHeader {
    pub status: u32,
    pub start_addr: u32,
    pub queue_type: u32,
    pub q_size: u32,
    pub pkt_size: u32,
    pub pkt_drop_cnt: u32,
    pub rx_wm: u32,
    pub tx_wm: u32,
    pub rx_req: u32,
    pub tx_req: u32,
    pub rx_irq_status: u32,
    pub tx_irq_status: u32,
    pub read_idx: u32,
    pub write_idx: u32,
}

/// The command, message and debug queues laid out in a shared memory region.
///
/// The same type is used by both sides of the protocol: the host writes the command queue and
/// reads the message and debug queues, while the firmware does the opposite.
pub struct InterfaceQueues<S: SharedMemory> {
    mem: S,
    /// Capacity of each ring, in words.
    queue_words: usize,
    /// Largest packet accepted by `read`, in words.
    max_read_words: usize,
}

impl<S: SharedMemory> InterfaceQueues<S> {
    /// Size in bytes of the shared region needed for rings of `queue_size` bytes each.
    pub fn required_size(queue_size: usize) -> usize {
        (ARRAYS_START_WORD + NUM_QUEUES * queue_size.div_ceil(4)) * 4
    }

    /// Lay out and initialize the queue table in `mem`, with rings of `queue_size` bytes each.
    /// Packets larger than `max_read_size` bytes are treated as corruption by `read`.
    pub fn new(mem: S, queue_size: usize, max_read_size: usize) -> Result<Self, QueueError> {
        if queue_size == 0 || queue_size % 4 != 0 {
            return Err(QueueError::InvalidQueueSize(queue_size));
        }
        let queue_words = queue_size / 4;
        let needed = ARRAYS_START_WORD + NUM_QUEUES * queue_words;
        if mem.num_words() < needed {
            return Err(QueueError::RegionTooSmall {
                needed,
                available: mem.num_words(),
            });
        }

        mem.store(TBL_VERSION, TABLE_VERSION);
        mem.store(TBL_SIZE, (needed * 4) as u32);
        mem.store(TBL_QHDR0_OFFSET, (TABLE_HEADER_WORDS * 4) as u32);
        mem.store(TBL_QHDR_SIZE, (QUEUE_HEADER_WORDS * 4) as u32);
        mem.store(TBL_NUM_Q, NUM_QUEUES as u32);
        mem.store(TBL_NUM_ACTIVE_Q, NUM_QUEUES as u32);

        let queues = Self {
            mem,
            queue_words,
            max_read_words: max_read_size.div_ceil(4),
        };

        for id in [
            HfiQueueType::Command,
            HfiQueueType::Message,
            HfiQueueType::Debug,
        ] {
            let base = queues.header_base(id);
            let ring_start = ((ARRAYS_START_WORD + id as usize * queue_words) * 4) as u32;
            let defaults = [
                (QHDR_STATUS, 1),
                (QHDR_START_ADDR, ring_start),
                (QHDR_TYPE, id as u32),
                (QHDR_Q_SIZE, queue_words as u32),
                (QHDR_PKT_SIZE, 0),
                (QHDR_PKT_DROP_CNT, 0),
                (QHDR_RX_WM, 1),
                (QHDR_TX_WM, 1),
                (QHDR_RX_REQ, if id == HfiQueueType::Debug { 0 } else { 1 }),
                (QHDR_TX_REQ, 0),
                (QHDR_RX_IRQ_STATUS, 0),
                (QHDR_TX_IRQ_STATUS, 0),
                (QHDR_READ_IDX, 0),
                (QHDR_WRITE_IDX, 0),
            ];
            for (field, value) in defaults {
                queues.mem.store(base + field, value);
            }
        }
        fence(Ordering::SeqCst);

        Ok(queues)
    }

    /// Access queues previously laid out by [`Self::new`], typically from the firmware side.
    pub fn attach(mem: S, max_read_size: usize) -> Result<Self, QueueError> {
        if mem.num_words() < ARRAYS_START_WORD {
            return Err(QueueError::RegionTooSmall {
                needed: ARRAYS_START_WORD,
                available: mem.num_words(),
            });
        }
        fence(Ordering::SeqCst);
        if mem.load(TBL_NUM_Q) != NUM_QUEUES as u32
            || mem.load(TBL_QHDR0_OFFSET) != (TABLE_HEADER_WORDS * 4) as u32
            || mem.load(TBL_QHDR_SIZE) != (QUEUE_HEADER_WORDS * 4) as u32
        {
            return Err(QueueError::InvalidTable);
        }

        let queue_words = mem.load(TABLE_HEADER_WORDS + QHDR_Q_SIZE) as usize;
        let needed = ARRAYS_START_WORD + NUM_QUEUES * queue_words;
        if queue_words == 0 {
            return Err(QueueError::InvalidTable);
        }
        if mem.num_words() < needed {
            return Err(QueueError::RegionTooSmall {
                needed,
                available: mem.num_words(),
            });
        }

        Ok(Self {
            mem,
            queue_words,
            max_read_words: max_read_size.div_ceil(4),
        })
    }

    fn header_base(&self, id: HfiQueueType) -> usize {
        TABLE_HEADER_WORDS + id as usize * QUEUE_HEADER_WORDS
    }

    fn ring_base(&self, id: HfiQueueType) -> usize {
        ARRAYS_START_WORD + id as usize * self.queue_words
    }

    /// Capacity of each ring, in bytes.
    pub fn queue_size(&self) -> usize {
        self.queue_words * 4
    }

    /// Returns a snapshot of the header of queue `id`.
    pub fn header(&self, id: HfiQueueType) -> QueueHeader {
        let base = self.header_base(id);
        let f = |field| self.mem.load(base + field);
        QueueHeader {
            status: f(QHDR_STATUS),
            start_addr: f(QHDR_START_ADDR),
            queue_type: f(QHDR_TYPE),
            q_size: f(QHDR_Q_SIZE),
            pkt_size: f(QHDR_PKT_SIZE),
            pkt_drop_cnt: f(QHDR_PKT_DROP_CNT),
            rx_wm: f(QHDR_RX_WM),
            tx_wm: f(QHDR_TX_WM),
            rx_req: f(QHDR_RX_REQ),
            tx_req: f(QHDR_TX_REQ),
            rx_irq_status: f(QHDR_RX_IRQ_STATUS),
            tx_irq_status: f(QHDR_TX_IRQ_STATUS),
            read_idx: f(QHDR_READ_IDX),
            write_idx: f(QHDR_WRITE_IDX),
        }
    }

    /// Write `packet` into queue `id`. The first word of `packet` is its size in bytes.
    ///
    /// The packet is either written completely or not at all. On success, returns whether the
    /// consumer asked to be interrupted when new data arrives.
    pub fn write(&self, id: HfiQueueType, packet: &[u8]) -> Result<bool, QueueError> {
        let size = match packet.get(0..4) {
            Some(word) => u32::from_le_bytes([word[0], word[1], word[2], word[3]]),
            None => return Err(QueueError::InvalidPacketSize(packet.len() as u32)),
        };
        let size_words = (size as usize).div_ceil(4);
        if size == 0 || size as usize > packet.len() || size_words > self.queue_words {
            return Err(QueueError::InvalidPacketSize(size));
        }

        let hdr = self.header_base(id);
        let q = self.queue_words;
        let read_idx = self.mem.load(hdr + QHDR_READ_IDX) as usize;
        let write_idx = self.mem.load(hdr + QHDR_WRITE_IDX) as usize;
        if read_idx >= q || write_idx >= q {
            error!(
                "queue {:?}: invalid indices read {} write {}",
                id, read_idx, write_idx
            );
            return Err(QueueError::Corrupt {
                read_idx: read_idx as u32,
                size,
            });
        }

        let free = if write_idx >= read_idx {
            q - (write_idx - read_idx)
        } else {
            read_idx - write_idx
        };
        // One word always stays free so that a full queue is distinguishable from an empty one.
        if free <= size_words {
            self.mem.store(hdr + QHDR_TX_REQ, 1);
            fence(Ordering::SeqCst);
            return Err(QueueError::Full {
                free,
                needed: size_words,
            });
        }
        self.mem.store(hdr + QHDR_TX_REQ, 0);

        let ring = self.ring_base(id);
        for i in 0..size_words {
            let mut bytes = [0u8; 4];
            for (j, byte) in bytes.iter_mut().enumerate() {
                if let Some(b) = packet.get(i * 4 + j) {
                    *byte = *b;
                }
            }
            self.mem
                .store(ring + (write_idx + i) % q, u32::from_le_bytes(bytes));
        }

        // The packet must be visible before the new write index.
        fence(Ordering::SeqCst);
        self.mem
            .store(hdr + QHDR_WRITE_IDX, ((write_idx + size_words) % q) as u32);
        let needs_interrupt = self.mem.load(hdr + QHDR_RX_REQ) == 1;
        fence(Ordering::SeqCst);

        Ok(needs_interrupt)
    }

    /// Read the next packet of queue `id` into `out`, replacing its previous content.
    ///
    /// On success, returns whether the producer asked to be interrupted once space is available.
    /// A packet with an invalid size makes the queue skip everything up to the producer's write
    /// index, and `Corrupt` is returned.
    pub fn read(&self, id: HfiQueueType, out: &mut Vec<u8>) -> Result<bool, QueueError> {
        let hdr = self.header_base(id);
        let q = self.queue_words;
        // Only the debug queue is polled, the other consumers want to be interrupted.
        let receive_request = if id == HfiQueueType::Debug { 0 } else { 1 };

        fence(Ordering::SeqCst);
        let read_idx = self.mem.load(hdr + QHDR_READ_IDX) as usize;
        let write_idx = self.mem.load(hdr + QHDR_WRITE_IDX) as usize;

        if read_idx == write_idx {
            self.mem.store(hdr + QHDR_RX_REQ, receive_request);
            fence(Ordering::SeqCst);
            return Err(QueueError::Empty);
        }

        if write_idx >= q {
            error!("queue {:?}: invalid write index {}", id, write_idx);
            return Err(QueueError::Corrupt {
                read_idx: read_idx as u32,
                size: 0,
            });
        }

        let ring = self.ring_base(id);
        let used = if write_idx >= read_idx {
            write_idx - read_idx
        } else {
            q - (read_idx - write_idx)
        };
        let size = if read_idx < q {
            self.mem.load(ring + read_idx)
        } else {
            0
        };
        let size_words = (size as usize).div_ceil(4);

        let result = if read_idx < q
            && size_words != 0
            && size_words <= self.max_read_words
            && size_words <= used
        {
            out.clear();
            out.reserve(size_words * 4);
            for i in 0..size_words {
                let word = self.mem.load(ring + (read_idx + i) % q);
                out.extend_from_slice(&word.to_le_bytes());
            }
            Ok((read_idx + size_words) % q)
        } else {
            warn!(
                "queue {:?}: bad packet of size {} at read index {}, dropping {} words",
                id, size, read_idx, used
            );
            Err(QueueError::Corrupt {
                read_idx: read_idx as u32,
                size: size_words as u32,
            })
        };

        // On corruption, resynchronize to the producer.
        let new_read_idx = *result.as_ref().unwrap_or(&write_idx);
        let rx_req = if new_read_idx != write_idx {
            0
        } else {
            receive_request
        };
        self.mem.store(hdr + QHDR_RX_REQ, rx_req);
        self.mem.store(hdr + QHDR_READ_IDX, new_read_idx as u32);
        fence(Ordering::SeqCst);

        let tx_req = self.mem.load(hdr + QHDR_TX_REQ) == 1;
        match result {
            Ok(_) => {
                debug!("queue {:?}: read {} words", id, size_words);
                Ok(tx_req)
            }
            Err(e) => Err(e),
        }
    }
}

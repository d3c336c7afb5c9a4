// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte-swapping definitions for big-endian hosts. Every multi-byte field is converted
//! individually since HFI structures only contain 32 and 64-bit integers.

use crate::io::LeWrapper;
use crate::protocol::HfiBuffer;
use crate::protocol::HfiHeader;
use crate::protocol::HfiPacket;

/// Trait for types that can be exchanged through the interface queues.
pub trait HfiType: Sized {
    fn to_le(self) -> LeWrapper<Self>;
    fn from_le(le: LeWrapper<Self>) -> Self;
}

impl HfiType for u32 {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self.swap_bytes())
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0.swap_bytes()
    }
}

impl HfiType for u64 {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self.swap_bytes())
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0.swap_bytes()
    }
}

fn swap_words<const N: usize>(words: [u32; N]) -> [u32; N] {
    words.map(u32::swap_bytes)
}

impl HfiType for HfiHeader {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(HfiHeader {
            size: self.size.swap_bytes(),
            session_id: self.session_id.swap_bytes(),
            header_id: self.header_id.swap_bytes(),
            reserved: swap_words(self.reserved),
            num_packets: self.num_packets.swap_bytes(),
        })
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        // Swapping is symmetrical.
        le.0.to_le().0
    }
}

impl HfiType for HfiPacket {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(HfiPacket {
            size: self.size.swap_bytes(),
            packet_type: self.packet_type.swap_bytes(),
            flags: self.flags.swap_bytes(),
            payload_info: self.payload_info.swap_bytes(),
            port: self.port.swap_bytes(),
            packet_id: self.packet_id.swap_bytes(),
            reserved: swap_words(self.reserved),
        })
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0.to_le().0
    }
}

impl HfiType for HfiBuffer {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(HfiBuffer {
            buffer_type: self.buffer_type.swap_bytes(),
            index: self.index.swap_bytes(),
            base_address: self.base_address.swap_bytes(),
            addr_offset: self.addr_offset.swap_bytes(),
            buffer_size: self.buffer_size.swap_bytes(),
            data_offset: self.data_offset.swap_bytes(),
            data_size: self.data_size.swap_bytes(),
            timestamp: self.timestamp.swap_bytes(),
            flags: self.flags.swap_bytes(),
            reserved: swap_words(self.reserved),
        })
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0.to_le().0
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Since the HFI wire format uses little-endian, a host using the same ordering does not need to
//! perform any swapping - hence the definitions here are no-ops.

use crate::io::LeWrapper;
use crate::protocol::HfiBuffer;
use crate::protocol::HfiHeader;
use crate::protocol::HfiPacket;

/// Trait for types that can be exchanged through the interface queues.
pub trait HfiType: Sized {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self)
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0
    }
}

impl HfiType for u32 {}
impl HfiType for u64 {}

impl HfiType for HfiHeader {}
impl HfiType for HfiPacket {}
impl HfiType for HfiBuffer {}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

/// Tunables of a [`crate::Core`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Maximum number of sessions open at the same time.
    pub max_sessions: usize,
    /// How long to wait for the firmware to acknowledge a blocking command.
    pub hw_response_timeout: Duration,
    /// Size of each interface queue, in bytes.
    pub queue_size: usize,
    /// Size of the largest command the host will build, in bytes.
    pub max_packet_size: usize,
    /// Size of the largest response accepted from the firmware, in bytes.
    pub huge_packet_size: usize,
    /// Polling interval while another caller is initializing the core.
    pub core_init_poll_interval: Duration,
    /// Log every packet sent and received at debug level.
    pub dump_packets: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            hw_response_timeout: Duration::from_millis(1000),
            queue_size: 1024 * 50 * 3,
            max_packet_size: 4096,
            huge_packet_size: 12 * 1024,
            core_init_poll_interval: Duration::from_millis(40),
            dump_packets: false,
        }
    }
}

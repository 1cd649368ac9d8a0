// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

/// Backpressure probe. The demux, pseudonode, and service report their
/// queue depths here; drivers that pace the protocol (notably the simulate
/// clock) key off whether loopback work is still pending.
pub trait EventsMonitor: Send + Sync {
    fn update_queue(&self, name: &'static str, len: usize);
}

/// Queue name the pseudonode reports under.
pub const PSEUDONODE_QUEUE: &str = "pseudonode";
/// Queue name the demux reports under.
pub const DEMUX_QUEUE: &str = "demux";

pub struct NullMonitor;

impl EventsMonitor for NullMonitor {
    fn update_queue(&self, _name: &'static str, _len: usize) {}
}

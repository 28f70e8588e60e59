//! Event capture inside the firing context
//!
//! Runs on the target's own thread at the moment a trap is hit, so it does
//! the least possible: take a guard on the site, stamp the clock, push one
//! fixed-size [`Event`]. No locks, no allocation, no blocking. A full
//! buffer costs an older event, never the target's time.
//!
//! The eBPF backend captures in the kernel instead (see `callscope-ebpf`);
//! this path serves in-process targets.

use std::sync::Arc;

use crate::domain::{Payload, Pid, Tid, Timestamp};
use crate::events::Event;
use crate::probes::ProbeSite;
use crate::transport::TransportBuffer;

/// Outcome of one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    /// Event enqueued
    Captured,
    /// Event enqueued, an older one was dropped for room
    CapturedWithEviction,
    /// Site is being detached, nothing recorded
    Inactive,
}

#[derive(Clone)]
pub struct Capture {
    buffer: Arc<TransportBuffer>,
}

impl Capture {
    #[must_use]
    pub fn new(buffer: Arc<TransportBuffer>) -> Self {
        Self { buffer }
    }

    /// Record one firing of `site`
    pub fn fire(&self, site: &ProbeSite, pid: Pid, tid: Tid, payload: Payload) -> Fired {
        let Some(guard) = site.enter() else {
            return Fired::Inactive;
        };
        let site = guard.site();
        let event = Event {
            probe: site.probe(),
            function: site.function(),
            pid,
            tid,
            timestamp: Timestamp::now(),
            kind: site.kind(),
            payload,
        };
        if self.buffer.push(event) {
            Fired::Captured
        } else {
            Fired::CapturedWithEviction
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<TransportBuffer> {
        &self.buffer
    }
}

//! Records moving from firing contexts to the correlator
//!
//! [`Event`] is what a probe firing produces: small, `Copy`, fixed size.
//! [`Notice`] is control information published by the probe manager
//! (attach, arm, detach, process exit). Both travel through the transport
//! buffer; notices are never dropped.

use callscope_common::CallEvent;
use std::sync::Arc;

use crate::domain::{AttachKind, FunctionId, Payload, Pid, ProbeId, Tid, Timestamp};

/// One probe firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub probe: ProbeId,
    pub function: FunctionId,
    pub pid: Pid,
    pub tid: Tid,
    pub timestamp: Timestamp,
    pub kind: AttachKind,
    pub payload: Payload,
}

impl Event {
    /// Decode a kernel ring-buffer record, `None` if the kind is unknown
    #[must_use]
    pub fn from_raw(raw: &CallEvent) -> Option<Self> {
        Some(Self {
            probe: ProbeId(raw.probe_id),
            function: FunctionId(raw.function_id),
            pid: Pid(raw.pid),
            tid: Tid(raw.tid),
            timestamp: Timestamp(raw.timestamp_ns),
            kind: AttachKind::from_raw(raw.kind)?,
            payload: Payload(raw.payload),
        })
    }
}

/// Probe lifecycle changes the correlator must observe in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Published before the trap is installed
    ProbeAttached {
        probe: ProbeId,
        function: FunctionId,
        symbol: Arc<str>,
        pid: Pid,
        kind: AttachKind,
    },
    /// Published once the trap is installed
    ///
    /// A return probe only pairs calls from here on; entries seen between
    /// `ProbeAttached` and `ProbeArmed` are reported as hits.
    ProbeArmed { probe: ProbeId, function: FunctionId, kind: AttachKind },
    /// Published after the probe is quiescent: no further events will carry `probe`
    ProbeDetached {
        probe: ProbeId,
        function: FunctionId,
        pid: Pid,
        kind: AttachKind,
        at: Timestamp,
    },
    /// The target exited; its traps are gone
    ProcessExited { pid: Pid, at: Timestamp },
}

/// What the transport hands the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Event(Event),
    Notice(Notice),
}

#[cfg(test)]
mod tests {
    use super::*;
    use callscope_common::{KIND_RETURN, PAYLOAD_WORDS};

    #[test]
    fn test_from_raw_event() {
        let raw = CallEvent {
            probe_id: 3,
            function_id: 1,
            pid: 100,
            tid: 101,
            timestamp_ns: 5_000,
            kind: KIND_RETURN,
            slot: 0,
            payload: [7; PAYLOAD_WORDS],
        };
        let event = Event::from_raw(&raw).unwrap();
        assert_eq!(event.probe, ProbeId(3));
        assert_eq!(event.kind, AttachKind::Return);
        assert_eq!(event.tid, Tid(101));
        assert_eq!(event.payload.0[5], 7);
    }

    #[test]
    fn test_from_raw_rejects_unknown_kind() {
        let raw = CallEvent {
            probe_id: 0,
            function_id: 0,
            pid: 0,
            tid: 0,
            timestamp_ns: 0,
            kind: 0,
            slot: 0,
            payload: [0; PAYLOAD_WORDS],
        };
        assert!(Event::from_raw(&raw).is_none());
    }
}

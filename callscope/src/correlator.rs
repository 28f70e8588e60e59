//! # Call Correlator
//!
//! Pairs entry and return events into [`CallRecord`]s.
//!
//! ## Algorithm
//!
//! Pending entries live on a stack per (thread, function):
//!
//! ```text
//! Idle ──Entry──► AwaitingReturn ──Return──► Idle
//!                   │    ▲
//!                   └────┘ nested Entry (recursion, depth > 1)
//! ```
//!
//! A return pops the top of its stack, so recursive calls complete
//! innermost first. A return with nothing to pop becomes an
//! [`Diagnostic::OrphanReturn`]; no record is invented for it.
//!
//! Entries are only held when the function has a live return probe.
//! Entry-only functions produce a [`ProbeHit`] per firing instead.
//!
//! Pending entries that can no longer be matched are flushed as incomplete
//! records: when the return probe is detached, when the process exits, and
//! when the session ends.
//!
//! The correlator is single-consumer state: exactly one [`CorrelatorWorker`]
//! owns it and nothing else touches the pending stacks.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use crate::analysis::CallSummary;
use crate::domain::{AttachKind, Duration, FunctionId, Payload, Pid, ProbeId, SessionError, Tid, Timestamp};
use crate::events::{Event, Message, Notice};
use crate::sink::Sink;
use crate::transport::Drain;

/// How long the worker parks when the buffer is empty
const IDLE_WAIT: StdDuration = StdDuration::from_millis(50);

/// Why a pending entry was flushed without a return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// The function's return probe was detached
    Detached,
    /// The target process exited
    ProcessExit,
    /// The session ended
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Completion {
    Returned,
    Incomplete(IncompleteReason),
}

/// One reconstructed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub function: FunctionId,
    pub symbol: Arc<str>,
    pub pid: Pid,
    pub tid: Tid,
    pub start: Timestamp,
    /// Return time, or flush time for incomplete calls; never before `start`
    pub end: Timestamp,
    pub entry_payload: Payload,
    pub exit_payload: Option<Payload>,
    pub completion: Completion,
}

impl CallRecord {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_since(self.start)
    }

    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self.completion, Completion::Incomplete(_))
    }
}

/// Firing of an entry probe on a function without a return probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeHit {
    pub function: FunctionId,
    pub symbol: Arc<str>,
    pub pid: Pid,
    pub tid: Tid,
    pub at: Timestamp,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "diagnostic", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A return with no pending entry on its (thread, function)
    OrphanReturn {
        function: FunctionId,
        symbol: Arc<str>,
        pid: Pid,
        tid: Tid,
        at: Timestamp,
        exit_payload: Payload,
    },
    /// Events lost to a full buffer since the previous report
    EventsDropped { count: u64, total: u64 },
}

/// Everything the correlator hands to a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Call(CallRecord),
    Hit(ProbeHit),
    Diagnostic(Diagnostic),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub events: u64,
    pub calls: u64,
    pub incomplete: u64,
    pub hits: u64,
    pub orphans: u64,
    pub dropped: u64,
    pub sink_failures: u64,
}

#[derive(Debug)]
struct PendingEntry {
    pid: Pid,
    start: Timestamp,
    payload: Payload,
}

#[derive(Debug)]
struct FunctionInfo {
    symbol: Arc<str>,
    pid: Pid,
    /// The return probe currently pairing calls, once installed
    return_probe: Option<ProbeId>,
}

const UNKNOWN_SYMBOL: &str = "<unknown>";

#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<(Tid, FunctionId), Vec<PendingEntry>>,
    functions: HashMap<FunctionId, FunctionInfo>,
    stats: CorrelatorStats,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &Event, mut emit: impl FnMut(Output)) {
        self.stats.events += 1;
        let key = (event.tid, event.function);

        match event.kind {
            AttachKind::Entry => {
                let armed = self.functions.get(&event.function).is_some_and(|f| f.return_probe.is_some());
                if armed {
                    self.pending.entry(key).or_default().push(PendingEntry {
                        pid: event.pid,
                        start: event.timestamp,
                        payload: event.payload,
                    });
                } else {
                    self.stats.hits += 1;
                    emit(Output::Hit(ProbeHit {
                        function: event.function,
                        symbol: self.symbol(event.function),
                        pid: event.pid,
                        tid: event.tid,
                        at: event.timestamp,
                        payload: event.payload,
                    }));
                }
            }
            AttachKind::Return => {
                let popped = self.pending.get_mut(&key).and_then(Vec::pop);
                if self.pending.get(&key).is_some_and(Vec::is_empty) {
                    self.pending.remove(&key);
                }

                match popped {
                    Some(entry) => {
                        self.stats.calls += 1;
                        emit(Output::Call(CallRecord {
                            function: event.function,
                            symbol: self.symbol(event.function),
                            pid: entry.pid,
                            tid: event.tid,
                            start: entry.start,
                            end: event.timestamp.max(entry.start),
                            entry_payload: entry.payload,
                            exit_payload: Some(event.payload),
                            completion: Completion::Returned,
                        }));
                    }
                    None => {
                        self.stats.orphans += 1;
                        debug!("Orphan return on {} {}", event.function, event.tid);
                        emit(Output::Diagnostic(Diagnostic::OrphanReturn {
                            function: event.function,
                            symbol: self.symbol(event.function),
                            pid: event.pid,
                            tid: event.tid,
                            at: event.timestamp,
                            exit_payload: event.payload,
                        }));
                    }
                }
            }
        }
    }

    pub fn on_notice(&mut self, notice: Notice, mut emit: impl FnMut(Output)) {
        match notice {
            Notice::ProbeAttached { function, symbol, pid, .. } => {
                self.functions.entry(function).or_insert(FunctionInfo { symbol, pid, return_probe: None });
            }
            Notice::ProbeArmed { probe, function, kind: AttachKind::Return } => {
                if let Some(info) = self.functions.get_mut(&function) {
                    info.return_probe = Some(probe);
                }
            }
            Notice::ProbeArmed { .. } => {}
            Notice::ProbeDetached { probe, function, kind: AttachKind::Return, at, .. } => {
                let Some(info) = self.functions.get_mut(&function) else { return };
                if info.return_probe != Some(probe) {
                    // Never armed: nothing was held for it
                    return;
                }
                info.return_probe = None;
                // No return can arrive for these any more
                self.flush_where(|(_, f), _| *f == function, IncompleteReason::Detached, at, &mut emit);
            }
            Notice::ProbeDetached { .. } => {}
            Notice::ProcessExited { pid, at } => {
                self.flush_where(|_, entry| entry.pid == pid, IncompleteReason::ProcessExit, at, &mut emit);
                self.functions.retain(|_, f| f.pid != pid);
            }
        }
    }

    /// Flush every pending entry as incomplete
    pub fn flush_all(&mut self, reason: IncompleteReason, at: Timestamp, mut emit: impl FnMut(Output)) {
        self.flush_where(|_, _| true, reason, at, &mut emit);
    }

    /// Entries currently awaiting a return
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    fn symbol(&self, function: FunctionId) -> Arc<str> {
        self.functions
            .get(&function)
            .map_or_else(|| Arc::from(UNKNOWN_SYMBOL), |f| Arc::clone(&f.symbol))
    }

    fn flush_where(
        &mut self,
        matches: impl Fn(&(Tid, FunctionId), &PendingEntry) -> bool,
        reason: IncompleteReason,
        at: Timestamp,
        emit: &mut impl FnMut(Output),
    ) {
        let mut keys: Vec<(Tid, FunctionId)> = self.pending.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            let Some(stack) = self.pending.get_mut(&key) else { continue };
            let mut flushed = Vec::new();
            stack.retain(|entry| {
                if matches(&key, entry) {
                    flushed.push(PendingEntry { pid: entry.pid, start: entry.start, payload: entry.payload });
                    false
                } else {
                    true
                }
            });
            if stack.is_empty() {
                self.pending.remove(&key);
            }

            // Innermost first, as a return would have completed them
            for entry in flushed.into_iter().rev() {
                self.stats.incomplete += 1;
                emit(Output::Call(CallRecord {
                    function: key.1,
                    symbol: self.symbol(key.1),
                    pid: entry.pid,
                    tid: key.0,
                    start: entry.start,
                    end: at.max(entry.start),
                    entry_payload: entry.payload,
                    exit_payload: None,
                    completion: Completion::Incomplete(reason),
                }));
            }
        }
    }
}

/// What the worker thread hands back when it finishes
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub stats: CorrelatorStats,
    pub summary: CallSummary,
}

/// The single consumer: drains the transport, correlates, delivers
pub struct CorrelatorWorker {
    handle: JoinHandle<WorkerReport>,
}

impl CorrelatorWorker {
    /// Start the correlator thread
    ///
    /// It runs until the transport is closed and drained, then flushes
    /// whatever is still pending as [`IncompleteReason::Shutdown`].
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned
    pub fn spawn<S: Sink + 'static>(drain: Drain, sink: S) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("callscope-correlator".to_string())
            .spawn(move || run(drain, sink))?;
        Ok(Self { handle })
    }

    /// Wait for the worker to finish
    ///
    /// # Errors
    /// Returns `CorrelatorPanicked` if the worker thread panicked
    pub fn join(self) -> Result<WorkerReport, SessionError> {
        self.handle.join().map_err(|_| SessionError::CorrelatorPanicked)
    }
}

fn run<S: Sink>(mut drain: Drain, mut sink: S) -> WorkerReport {
    let mut correlator = Correlator::new();
    let mut summary = CallSummary::default();
    let mut sink_failures = 0u64;
    let mut reported_drops = 0u64;

    let mut deliver = |output: Output| {
        summary.record(&output);
        if let Err(e) = sink.deliver(&output) {
            sink_failures += 1;
            warn!("Sink rejected record: {e}");
        }
    };

    loop {
        while let Some(message) = drain.next() {
            match message {
                Message::Event(event) => correlator.on_event(&event, &mut deliver),
                Message::Notice(notice) => correlator.on_notice(notice, &mut deliver),
            }
        }

        let total = drain.buffer().dropped();
        if total > reported_drops {
            deliver(Output::Diagnostic(Diagnostic::EventsDropped { count: total - reported_drops, total }));
            reported_drops = total;
        }

        if drain.is_finished() {
            break;
        }
        drain.wait(IDLE_WAIT);
    }

    correlator.flush_all(IncompleteReason::Shutdown, Timestamp::now(), &mut deliver);
    drop(deliver);

    let mut stats = correlator.stats();
    stats.dropped = reported_drops;
    stats.sink_failures = sink_failures;
    if let Err(e) = sink.flush() {
        warn!("Failed to flush sink: {e}");
    }
    debug!("Correlator finished: {stats:?}");
    WorkerReport { stats, summary }
}

//! One tracing session: probe manager, transport and correlator wired together
//!
//! ```text
//! ProbeManager ──(traps)──► Capture ──► TransportBuffer ──► CorrelatorWorker ──► Sink
//!      │                                      ▲
//!      └───────────── notices ────────────────┘
//! ```
//!
//! [`Session::finish`] tears down in dependency order: probes first, then
//! the backend (its pump drains what is still in flight), then the
//! transport, then the worker, which flushes anything still pending.

use log::info;
use serde::Serialize;
use std::sync::Arc;

use crate::analysis::CallSummary;
use crate::correlator::{CorrelatorStats, CorrelatorWorker};
use crate::domain::{AttachError, Duration, Pid, SessionError, Timestamp};
use crate::probes::{ProbeBackend, ProbeHandle, ProbeManager, ProbeSpec};
use crate::sink::Sink;
use crate::transport::{Drain, TransportBuffer};

/// Final accounting of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub stats: CorrelatorStats,
    #[serde(skip)]
    pub calls: CallSummary,
    /// Events that reached the transport buffer
    pub accepted: u64,
    /// Events lost, in the kernel or in the transport buffer
    pub dropped: u64,
    pub elapsed: Duration,
}

pub struct Session<B: ProbeBackend> {
    manager: ProbeManager<B>,
    buffer: Arc<TransportBuffer>,
    worker: CorrelatorWorker,
    started: Timestamp,
}

impl<B: ProbeBackend> Session<B> {
    /// Start the correlator on `drain`, delivering to `sink`
    ///
    /// # Errors
    /// Returns an error if the correlator thread cannot be started
    pub fn start<S: Sink + 'static>(manager: ProbeManager<B>, drain: Drain, sink: S) -> Result<Self, SessionError> {
        let buffer = Arc::clone(drain.buffer());
        let worker = CorrelatorWorker::spawn(drain, sink)?;
        Ok(Self { manager, buffer, worker, started: Timestamp::now() })
    }

    /// # Errors
    /// See [`ProbeManager::attach`]
    pub fn attach(&mut self, spec: ProbeSpec) -> Result<ProbeHandle, AttachError> {
        self.manager.attach(spec)
    }

    /// # Errors
    /// See [`ProbeManager::detach`]
    pub fn detach(&mut self, handle: ProbeHandle) -> Result<(), AttachError> {
        self.manager.detach(handle)
    }

    pub fn process_exited(&mut self, pid: Pid) -> usize {
        self.manager.process_exited(pid)
    }

    #[must_use]
    pub fn manager(&self) -> &ProbeManager<B> {
        &self.manager
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<TransportBuffer> {
        &self.buffer
    }

    /// Detach everything, drain, flush and stop
    ///
    /// # Errors
    /// Returns `CorrelatorPanicked` if the worker died
    pub fn finish(self) -> Result<SessionSummary, SessionError> {
        let Session { mut manager, buffer, worker, started } = self;

        let detached = manager.detach_all();
        drop(manager);
        buffer.close();

        let report = worker.join()?;
        let elapsed = Timestamp::now().saturating_since(started);
        info!("Session finished after {elapsed}: {detached} probes detached, {} calls", report.stats.calls);

        Ok(SessionSummary {
            stats: report.stats,
            calls: report.summary,
            accepted: buffer.accepted(),
            dropped: buffer.dropped(),
            elapsed,
        })
    }
}

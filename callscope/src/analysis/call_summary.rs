//! Per-function call statistics.
//!
//! Aggregates correlator output as it streams past the sink, so the CLI can
//! print where the time went when the session ends.
//!
//! # Performance
//!
//! - `record()`: O(1) amortized (HashMap insert/update)
//! - `to_functions()`: O(n log n) where n = unique functions (sorting)

// Mean calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::sync::Arc;

use crate::correlator::{Diagnostic, Output};
use crate::domain::{Duration, FunctionId, Pid};

// =============================================================================
// FUNCTION CALLS (OUTPUT TYPE)
// =============================================================================

/// Aggregated statistics for one instrumented function.
///
/// # Display
///
/// ```text
/// FUNCTION              CALLS  INCOMPLETE      TOTAL       MEAN        MAX
/// dummy_SSL_write           5           0    75.40ms    15.08ms    15.21ms
/// dummy_SSL_read            5           -          -          -          -
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCalls {
    pub function: FunctionId,
    pub symbol: Arc<str>,
    pub pid: Pid,

    /// Calls that returned.
    pub completed: u64,

    /// Calls flushed without a return.
    pub incomplete: u64,

    /// Entry firings on a function with no return probe.
    pub hits: u64,

    /// Returns that matched no entry.
    pub orphans: u64,

    /// Summed over completed calls only.
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl FunctionCalls {
    fn new(function: FunctionId, symbol: Arc<str>, pid: Pid) -> Self {
        Self {
            function,
            symbol,
            pid,
            completed: 0,
            incomplete: 0,
            hits: 0,
            orphans: 0,
            total: Duration(0),
            min: None,
            max: None,
        }
    }

    /// Mean duration of completed calls.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        Some(Duration(self.total.0 / self.completed))
    }

    /// Completed calls per second over `window`.
    #[must_use]
    pub fn rate(&self, window: Duration) -> f64 {
        if window.0 == 0 {
            return 0.0;
        }
        self.completed as f64 / window.as_seconds()
    }
}

// =============================================================================
// CALL SUMMARY (AGGREGATOR)
// =============================================================================

/// Streaming aggregator over correlator output.
#[derive(Debug, Default, Clone)]
pub struct CallSummary {
    functions: HashMap<FunctionId, FunctionCalls>,

    /// Events lost anywhere between capture and correlation.
    dropped: u64,
}

impl CallSummary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one output into the summary.
    pub fn record(&mut self, output: &Output) {
        match output {
            Output::Call(record) => {
                let stats = self.entry(record.function, &record.symbol, record.pid);
                if record.is_incomplete() {
                    stats.incomplete += 1;
                    return;
                }
                let duration = record.duration();
                stats.completed += 1;
                stats.total = Duration(stats.total.0 + duration.0);
                stats.min = Some(stats.min.map_or(duration, |m| m.min(duration)));
                stats.max = Some(stats.max.map_or(duration, |m| m.max(duration)));
            }
            Output::Hit(hit) => {
                self.entry(hit.function, &hit.symbol, hit.pid).hits += 1;
            }
            Output::Diagnostic(Diagnostic::OrphanReturn { function, symbol, pid, .. }) => {
                self.entry(*function, symbol, *pid).orphans += 1;
            }
            Output::Diagnostic(Diagnostic::EventsDropped { count, .. }) => {
                self.dropped += *count;
            }
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Per-function statistics, most total time first.
    ///
    /// Functions without completed calls follow, ordered by activity.
    #[must_use]
    pub fn to_functions(&self) -> Vec<FunctionCalls> {
        let mut functions: Vec<FunctionCalls> = self.functions.values().cloned().collect();
        functions.sort_by(|a, b| {
            b.total
                .cmp(&a.total)
                .then_with(|| (b.hits + b.incomplete).cmp(&(a.hits + a.incomplete)))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        functions
    }

    fn entry(&mut self, function: FunctionId, symbol: &Arc<str>, pid: Pid) -> &mut FunctionCalls {
        self.functions
            .entry(function)
            .or_insert_with(|| FunctionCalls::new(function, Arc::clone(symbol), pid))
    }
}

// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use crate::analysis::FunctionCalls;
use crate::domain::Duration;
use crate::session::SessionSummary;
use crate::transport::TransportBuffer;

/// Periodic one-line status while tracing
pub fn display_statistics(buffer: &TransportBuffer, kernel_dropped: u64) {
    eprintln!(
        "stats: events={} queued={}/{} dropped={} (kernel: {})",
        buffer.accepted(),
        buffer.len(),
        buffer.capacity(),
        buffer.dropped(),
        kernel_dropped
    );
}

/// End-of-session summary: counters, then the per-function table
pub fn print_summary(exit_reason: &str, summary: &SessionSummary) {
    let stats = &summary.stats;
    eprintln!(
        "\n{exit_reason}: {:.1}s, {} events, {} calls ({} incomplete), {} hits, {} orphan returns, {} dropped",
        summary.elapsed.as_seconds(),
        stats.events,
        stats.calls + stats.incomplete,
        stats.incomplete,
        stats.hits,
        stats.orphans,
        summary.dropped,
    );
    if stats.sink_failures > 0 {
        eprintln!("warning: {} records could not be delivered", stats.sink_failures);
    }

    let functions = summary.calls.to_functions();
    if functions.is_empty() {
        return;
    }
    eprintln!();
    for line in format_table(&functions, summary.elapsed) {
        eprintln!("{line}");
    }
}

fn format_table(functions: &[FunctionCalls], window: Duration) -> Vec<String> {
    let width = functions.iter().map(|f| f.symbol.len()).max().unwrap_or(0).max("FUNCTION".len());
    let mut lines = vec![format!(
        "{:<width$}  {:>7}  {:>10}  {:>10}  {:>10}  {:>10}  {:>8}",
        "FUNCTION", "CALLS", "INCOMPLETE", "TOTAL", "MEAN", "MAX", "RATE"
    )];

    for f in functions {
        let line = if f.completed == 0 && f.incomplete == 0 {
            format!(
                "{:<width$}  {:>7}  {:>10}  {:>10}  {:>10}  {:>10}  {:>8}",
                f.symbol, f.hits, "-", "-", "-", "-", "-"
            )
        } else {
            format!(
                "{:<width$}  {:>7}  {:>10}  {:>10}  {:>10}  {:>10}  {:>8}",
                f.symbol,
                f.completed,
                f.incomplete,
                f.total.to_string(),
                f.mean().map_or_else(|| "-".to_string(), |d| d.to_string()),
                f.max.map_or_else(|| "-".to_string(), |d| d.to_string()),
                format!("{:.1}/s", f.rate(window)),
            )
        };
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::CallSummary;
    use crate::correlator::{CallRecord, Completion, Output};
    use crate::domain::{FunctionId, Payload, Pid, Tid, Timestamp};
    use std::sync::Arc;

    #[test]
    fn test_table_layout() {
        let mut summary = CallSummary::new();
        for end in [15_000_000, 16_000_000] {
            summary.record(&Output::Call(CallRecord {
                function: FunctionId(1),
                symbol: Arc::from("dummy_SSL_write"),
                pid: Pid(1),
                tid: Tid(1),
                start: Timestamp(0),
                end: Timestamp(end),
                entry_payload: Payload::default(),
                exit_payload: None,
                completion: Completion::Returned,
            }));
        }

        let lines = format_table(&summary.to_functions(), Duration(4_000_000_000));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("FUNCTION"));
        assert!(lines[1].starts_with("dummy_SSL_write"));
        assert!(lines[1].contains("31.00ms"));
        assert!(lines[1].contains("15.50ms"));
        assert!(lines[1].contains("16.00ms"));
        assert!(lines[0].ends_with("RATE"));
        assert!(lines[1].ends_with("0.5/s"));
    }
}

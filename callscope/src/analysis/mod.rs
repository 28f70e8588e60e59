//! Analysis of correlated call records
//!
//! Pure aggregation, separated from the sinks that print or ship records.

pub mod call_summary;

pub use call_summary::{CallSummary, FunctionCalls};

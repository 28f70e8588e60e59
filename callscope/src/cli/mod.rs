//! Command-line surface: arguments, resolved configuration, terminal reports

pub mod args;
pub mod config;
pub mod report;

pub use args::{Args, OutputFormat, DEFAULT_BPF_OBJECT};
pub use config::{probe_plan, ProbeRequest, SessionConfig};
pub use report::{display_statistics, print_summary};

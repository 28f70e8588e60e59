//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::transport::DEFAULT_CAPACITY;

/// Where `cargo xtask build-ebpf --release` leaves the probe object
pub const DEFAULT_BPF_OBJECT: &str = "target/bpfel-unknown-none/release/callscope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ENTERED / EXITED lines
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "callscope",
    version,
    about = "Trace calls to named functions in a running process",
    after_help = "\
EXAMPLES:
    sudo callscope dummy-tls-client --entry dummy_SSL_read --call dummy_SSL_write
    sudo callscope --pid 1234 --call SSL_read --call SSL_write --format json
    sudo callscope my-app --call my_app::handler --duration 30 --output calls.jsonl"
)]
pub struct Args {
    /// Process name to trace (auto-detects PID)
    #[arg(value_name = "PROCESS", conflicts_with = "pid")]
    pub process: Option<String>,

    /// Process ID to trace
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Report every call of SYMBOL as it is entered
    #[arg(long = "entry", value_name = "SYMBOL")]
    pub entry: Vec<String>,

    /// Report every return from SYMBOL
    #[arg(long = "return", value_name = "SYMBOL")]
    pub ret: Vec<String>,

    /// Trace SYMBOL on entry and return, reporting call durations
    #[arg(short, long = "call", value_name = "SYMBOL")]
    pub call: Vec<String>,

    /// Events held between the probes and the correlator
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub buffer_capacity: usize,

    /// Compiled probe object
    #[arg(long, value_name = "PATH", default_value = DEFAULT_BPF_OBJECT)]
    pub bpf_object: PathBuf,

    /// Record format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Write records to FILE instead of the terminal
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Don't capture argument registers on entry
    #[arg(long)]
    pub no_args: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

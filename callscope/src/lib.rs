//! # callscope - Dynamic Function Call Tracing
//!
//! callscope attaches entry and return probes to named functions of a
//! running process, without modifying or restarting it, and turns the
//! stream of probe firings into correlated call records: which thread
//! called what, with which arguments, for how long, and what it returned.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Target Process                             │
//! │              (dummy_SSL_read, dummy_SSL_write, ...)             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobe / uretprobe traps
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  eBPF Programs (Kernel)                         │
//! │  • call_entry_N: timestamp + argument registers                 │
//! │  • call_return_N: timestamp + return register                   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer events
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    callscope (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Probes    │──▶│  Transport   │──▶│  Correlator  │         │
//! │  │  (manager)   │   │   (bounded)  │   │   (worker)   │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │         │                                     │                 │
//! │         ▼                                     ▼                 │
//! │  ┌──────────────┐                      ┌──────────────┐         │
//! │  │ Symbolizer   │                      │     Sink     │         │
//! │  │   (ELF)      │                      │ (text/json)  │         │
//! │  └──────────────┘                      └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`probes`]: attach/detach lifecycle, quiescence, and the two backends
//!   (kernel uprobes via aya, and an in-process trap table)
//! - [`capture`]: what a firing records and hands to the transport
//! - [`transport`]: bounded, non-blocking buffer between firings and the
//!   correlator; drops oldest on overflow and counts every drop
//! - [`correlator`]: pairs entries with returns per (thread, function)
//! - [`sink`]: where records go (text lines, JSON lines, a channel)
//! - [`session`]: wires the pieces together and tears them down in order
//! - [`symbolization`]: symbol name to binary + file offset
//! - [`analysis`]: per-function aggregation for the end-of-run table
//! - [`cli`], [`preflight`], [`process_lookup`]: the command-line surface
//! - [`domain`]: identifiers, time, payloads and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Durations of every dummy_SSL_write, entries of dummy_SSL_read
//! sudo callscope dummy-tls-client --entry dummy_SSL_read --call dummy_SSL_write
//!
//! # JSON records for 30 seconds
//! sudo callscope --pid 1234 --call SSL_write --format json --duration 30
//! ```
//!
//! ## Key Concepts
//!
//! - **Probe**: a trap on one symbol, at entry or at return, in one process
//! - **Quiescence**: detach returns only once no firing still uses the probe
//! - **Incomplete call**: an entry whose return can no longer be observed

pub mod analysis;
pub mod capture;
pub mod cli;
pub mod correlator;
pub mod domain;
pub mod events;
pub mod preflight;
pub mod probes;
pub mod process_lookup;
pub mod session;
pub mod sink;
pub mod symbolization;
pub mod transport;

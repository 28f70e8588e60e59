//! Structured error types for callscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only [`SessionError`] is fatal; everything else is reported per probe or
//! per record and the session carries on.

use super::types::{AttachKind, Pid};
use std::path::PathBuf;
use thiserror::Error;

/// A symbol could not be turned into an attachable location
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Symbol {symbol} not found in any object mapped by {pid}")]
    SymbolNotFound { pid: Pid, symbol: String },

    #[error("Failed to read /proc/{0}/maps")]
    MemoryMapsUnreadable(Pid, #[source] std::io::Error),

    #[error("Failed to parse {path}: {reason}")]
    ObjectParseFailed { path: PathBuf, reason: String },
}

/// Attaching or detaching one probe failed
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("{kind} probe on {symbol} is already attached to {pid}")]
    AlreadyAttached { symbol: String, kind: AttachKind, pid: Pid },

    #[error("Permission denied instrumenting {pid}")]
    PermissionDenied { pid: Pid },

    #[error("Process {0} not found")]
    NoSuchProcess(Pid),

    #[error("Process {0} exited while the probe was being attached")]
    ProcessGone(Pid),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("All {kind} probe slots are in use")]
    SlotsExhausted { kind: AttachKind },

    #[error("Failed to attach {kind} probe to {symbol}: {error}")]
    Backend { symbol: String, kind: AttachKind, error: String },
}

/// A sink could not accept a record
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink is closed")]
    Closed,

    #[error("Sink is full, record discarded")]
    Full,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures that abort the whole session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load eBPF object {path}: {error}")]
    EbpfLoadFailed { path: PathBuf, error: String },

    #[error("eBPF map {0} not found")]
    MapNotFound(&'static str),

    #[error("Correlator thread panicked")]
    CorrelatorPanicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),
}

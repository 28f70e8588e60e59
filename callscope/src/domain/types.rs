//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a TID where a
//! PID is expected, and make function signatures more expressive.

use callscope_common::{KIND_ENTRY, KIND_RETURN, PAYLOAD_WORDS};
use serde::Serialize;
use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

impl From<Pid> for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// Thread ID
///
/// Kernel thread IDs are unique system-wide, which is what lets the
/// correlator key pending calls by thread alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Unique identity of one attached (or attachable) probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProbeId(pub u32);

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe#{}", self.0)
    }
}

/// Logical function identity, shared by the entry and return probes
/// attached to the same symbol of the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Where a probe fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachKind {
    /// When the function is called
    Entry,
    /// When the function is about to return
    Return,
}

impl AttachKind {
    /// Wire value used in the kernel event record
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            AttachKind::Entry => KIND_ENTRY,
            AttachKind::Return => KIND_RETURN,
        }
    }

    /// Decode the wire value, `None` for anything unknown
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            KIND_ENTRY => Some(AttachKind::Entry),
            KIND_RETURN => Some(AttachKind::Return),
            _ => None,
        }
    }
}

impl fmt::Display for AttachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachKind::Entry => write!(f, "entry"),
            AttachKind::Return => write!(f, "return"),
        }
    }
}

/// Timestamp in nanoseconds
///
/// CLOCK_MONOTONIC, the clock `bpf_ktime_get_ns()` reads, so kernel event
/// timestamps and userspace flush times are directly comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Read the monotonic clock
    #[must_use]
    #[allow(unsafe_code, clippy::cast_sign_loss)]
    pub fn now() -> Self {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: `ts` is a valid, writable timespec; CLOCK_MONOTONIC always exists on Linux
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        Timestamp(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    #[must_use]
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    /// Convert to seconds (f64)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_seconds())
    }
}

/// Duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Duration(pub u64);

impl Duration {
    /// Convert to milliseconds (f64)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to seconds (f64)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.as_millis();
        if ms >= 1000.0 {
            write!(f, "{:.2}s", self.as_seconds())
        } else if ms >= 1.0 {
            write!(f, "{ms:.2}ms")
        } else {
            write!(f, "{:.1}us", self.0 as f64 / 1_000.0)
        }
    }
}

/// Fixed-size captured context of one firing
///
/// Argument registers for entry probes, return value in word 0 for return
/// probes. Bounded so capture never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Payload(pub [u64; PAYLOAD_WORDS]);

impl Payload {
    /// Payload with only the first word set (return values)
    #[must_use]
    pub fn word(value: u64) -> Self {
        let mut words = [0u64; PAYLOAD_WORDS];
        words[0] = value;
        Payload(words)
    }
}

//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the records exchanged between the kernel-side probe programs and
//! userspace. All types use `#[repr(C)]` for consistent memory layout across
//! the kernel/userspace boundary.
//!
//! ## Key Types
//!
//! - [`CallEvent`] - One probe firing, written to the `EVENTS` ring buffer
//! - [`SlotBinding`] - Probe identity bound to a program slot by userspace
//!
//! ## Program Slots
//!
//! The kernel object carries `MAX_PROBE_SLOTS` entry programs
//! (`call_entry_0` ..) and as many return programs (`call_return_0` ..).
//! Userspace binds a slot to a probe before attaching it and unbinds the
//! slot after detaching, so one compiled object serves any symbol.

#![no_std]

// ============================================================================
// Attach Kinds
// ============================================================================

/// Probe fired on function entry (`uprobe`)
pub const KIND_ENTRY: u32 = 1;

/// Probe fired when the function is about to return (`uretprobe`)
pub const KIND_RETURN: u32 = 2;

// ============================================================================
// Limits
// ============================================================================

/// Number of 64-bit words captured per firing.
///
/// Entry probes fill all six with the integer argument registers
/// (System V: rdi, rsi, rdx, rcx, r8, r9). Return probes fill word 0 with
/// the return value and leave the rest zeroed.
pub const PAYLOAD_WORDS: usize = 6;

/// Program slots compiled into the kernel object, per attach kind.
pub const MAX_PROBE_SLOTS: u32 = 8;

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// Non-zero: entry probes copy argument registers into the payload
pub const CONFIG_CAPTURE_ARGS: u32 = 0;

/// Key into `SLOT_BINDINGS` for a given kind and slot.
#[must_use]
pub const fn slot_key(kind: u32, slot: u32) -> u32 {
    (kind << 16) | slot
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from eBPF to userspace via ring buffer
///
/// **Size**: 80 bytes, kept small to minimize ring buffer overhead
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CallEvent {
    /// Probe that fired (copied from the slot binding)
    pub probe_id: u32,

    /// Function identity shared by the entry and return probes of one symbol
    pub function_id: u32,

    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Thread ID (PID in Linux terms, TID in userspace)
    pub tid: u32,

    /// Monotonic timestamp from `bpf_ktime_get_ns()`
    pub timestamp_ns: u64,

    /// `KIND_ENTRY` or `KIND_RETURN`
    pub kind: u32,

    /// Program slot that produced the event (diagnostics only)
    pub slot: u32,

    /// Captured registers, see [`PAYLOAD_WORDS`]
    pub payload: [u64; PAYLOAD_WORDS],
}

/// Identity of the probe currently bound to a program slot
///
/// Written by userspace into `SLOT_BINDINGS` before the link is created and
/// removed after it is torn down.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotBinding {
    pub probe_id: u32,
    pub function_id: u32,
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for CallEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SlotBinding {}

//! # eBPF Kernel-Side Capture
//!
//! Entry and return probe programs that run inside the Linux kernel each
//! time an instrumented function is called or returns.
//!
//! ## Programs
//!
//! - **Uprobe**: `call_entry_{0..7}` - function entry, captures argument registers
//! - **Uretprobe**: `call_return_{0..7}` - function return, captures the return value
//!
//! Every program is the same capture routine; the slot number only selects
//! which `SLOT_BINDINGS` entry names the probe.
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (1MB) for the event stream
//! - `SLOT_BINDINGS` - Slot → probe/function identity
//! - `DROPPED` - Per-CPU count of events the ring buffer rejected
//! - `CONFIG` - Runtime configuration (argument capture)
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{map, uprobe, uretprobe},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::warn;
use callscope_common::{
    slot_key, CallEvent, SlotBinding, CONFIG_CAPTURE_ARGS, KIND_ENTRY, KIND_RETURN,
    MAX_PROBE_SLOTS, PAYLOAD_WORDS,
};

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace
///
/// A full buffer rejects the new event; the rejection is counted in `DROPPED`.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

/// Map: `slot_key(kind, slot)` → probe identity
#[map]
static SLOT_BINDINGS: HashMap<u32, SlotBinding> =
    HashMap::with_max_entries(2 * MAX_PROBE_SLOTS, 0);

/// Events the ring buffer refused (per CPU, summed by userspace)
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Map: Config key → Config value
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

// ============================================================================
// Program Slots
// ============================================================================

macro_rules! probe_slots {
    ($($slot:literal => $entry:ident, $ret:ident;)*) => {
        $(
            #[uprobe]
            pub fn $entry(ctx: ProbeContext) -> u32 {
                match try_capture_entry(&ctx, $slot) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            }

            #[uretprobe]
            pub fn $ret(ctx: RetProbeContext) -> u32 {
                match try_capture_return(&ctx, $slot) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            }
        )*
    };
}

probe_slots! {
    0 => call_entry_0, call_return_0;
    1 => call_entry_1, call_return_1;
    2 => call_entry_2, call_return_2;
    3 => call_entry_3, call_return_3;
    4 => call_entry_4, call_return_4;
    5 => call_entry_5, call_return_5;
    6 => call_entry_6, call_return_6;
    7 => call_entry_7, call_return_7;
}

// ============================================================================
// Capture
// ============================================================================

fn try_capture_entry(ctx: &ProbeContext, slot: u32) -> Result<(), i64> {
    let Some(binding) = lookup_binding(KIND_ENTRY, slot) else {
        warn!(ctx, "entry slot {} fired without a binding", slot);
        return Ok(());
    };

    let mut payload = [0u64; PAYLOAD_WORDS];
    if capture_args() {
        // Unrolled by the compiler; the verifier rejects unbounded loops
        for (i, word) in payload.iter_mut().enumerate() {
            *word = ctx.arg::<u64>(i).unwrap_or(0);
        }
    }

    emit(binding, KIND_ENTRY, slot, payload)
}

fn try_capture_return(ctx: &RetProbeContext, slot: u32) -> Result<(), i64> {
    let Some(binding) = lookup_binding(KIND_RETURN, slot) else {
        warn!(ctx, "return slot {} fired without a binding", slot);
        return Ok(());
    };

    let mut payload = [0u64; PAYLOAD_WORDS];
    payload[0] = ctx.ret::<u64>().unwrap_or(0);

    emit(binding, KIND_RETURN, slot, payload)
}

fn emit(binding: SlotBinding, kind: u32, slot: u32, payload: [u64; PAYLOAD_WORDS]) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };

    let event = CallEvent {
        probe_id: binding.probe_id,
        function_id: binding.function_id,
        pid: (pid_tgid >> 32) as u32,
        tid: pid_tgid as u32,
        timestamp_ns: unsafe { bpf_ktime_get_ns() },
        kind,
        slot,
        payload,
    };

    if EVENTS.output(&event, 0).is_err() {
        count_drop();
        return Err(1);
    }
    Ok(())
}

fn lookup_binding(kind: u32, slot: u32) -> Option<SlotBinding> {
    unsafe { SLOT_BINDINGS.get(&slot_key(kind, slot)).copied() }
}

fn capture_args() -> bool {
    unsafe { CONFIG.get(&CONFIG_CAPTURE_ARGS).copied().unwrap_or(1) != 0 }
}

fn count_drop() {
    if let Some(counter) = DROPPED.get_ptr_mut(0) {
        // Per-CPU slot, no other writer can race us
        unsafe { *counter += 1 };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

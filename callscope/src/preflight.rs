//! Pre-flight checks for callscope
//!
//! Validates system requirements before attempting to load the probe
//! object. Provides clear, actionable error messages when requirements
//! aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Architecture, Object, ObjectSymbol};
use std::path::Path;

use crate::domain::Pid;

/// Minimum kernel version: BPF ring buffers arrived in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// A program every usable probe object carries
const REQUIRED_PROGRAM: &str = "call_entry_0";

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed check, with remediation advice
pub fn run_preflight_checks(bpf_object: &Path, pid: Pid) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_bpf_object(bpf_object)?;
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
///
/// # Errors
/// Returns an error unless running as root
pub fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would be enough, but checking capabilities
    // needs more than libc gives us
    bail!(
        "Permission denied: callscope requires root privileges to attach uprobes.\n\n\
         Run with: sudo callscope ..."
    );
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             callscope requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }
    Ok(())
}

/// `"5.15.0-generic"` → `(5, 15)`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check the probe object exists and is a BPF ELF with the capture programs
///
/// # Errors
/// Returns an error if the object is missing, unreadable, or not ours
pub fn check_bpf_object(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!(
            "eBPF object not found: {}\n\n\
             Build it with: cargo xtask build-ebpf --release\n\
             or point --bpf-object at an existing build.",
            path.display()
        );
    }

    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let obj = object::File::parse(&*data)
        .with_context(|| format!("{} is not an ELF object", path.display()))?;

    if obj.architecture() != Architecture::Bpf {
        bail!("{} is a {:?} object, not eBPF", path.display(), obj.architecture());
    }
    if !obj.symbols().any(|s| s.name() == Ok(REQUIRED_PROGRAM)) {
        bail!(
            "{} has no {REQUIRED_PROGRAM} program.\n\n\
             Was it built from callscope-ebpf?",
            path.display()
        );
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is absent
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps (needed for symbol resolution)
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}

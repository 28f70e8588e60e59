//! Find the target process by name.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Pid;

/// A running process that could be instrumented.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
}

/// Find exactly one process by name.
///
/// Matches against the command name from `/proc/<pid>/stat` and the
/// executable basename from `/proc/<pid>/exe`. Our own process never
/// matches.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let own_pid = std::process::id();
    let mut matches: Vec<ProcessInfo> = Vec::new();

    for entry in fs::read_dir("/proc").context("Failed to read /proc")?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        if let Some(info) = describe(Pid(pid)) {
            if is_match(&info.command, &info.exe_path, name) {
                matches.push(info);
            }
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: callscope --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Look up one process by PID.
///
/// # Errors
/// Returns error if the process doesn't exist or its `/proc` entries are not readable.
pub fn process_info(pid: Pid) -> Result<ProcessInfo> {
    let exe_link = format!("/proc/{}/exe", pid.0);
    let exe_path = fs::read_link(&exe_link).with_context(|| format!("Cannot read {exe_link}"))?;
    let stat_path = format!("/proc/{}/stat", pid.0);
    let stat = fs::read_to_string(&stat_path).with_context(|| format!("Cannot read {stat_path}"))?;
    Ok(ProcessInfo { pid, exe_path, command: extract_comm(&stat)? })
}

// Kernel threads have no exe link and are skipped
fn describe(pid: Pid) -> Option<ProcessInfo> {
    process_info(pid).ok()
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let pattern_basename = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    // comm is truncated to 15 bytes by the kernel
    let truncated: String = pattern_basename.chars().take(15).collect();

    command == truncated
        || exe_basename == pattern_basename
        || command.contains(pattern)
        || exe_basename.contains(pattern)
}

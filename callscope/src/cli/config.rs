//! Resolved session configuration

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::args::{Args, OutputFormat};
use crate::domain::{AttachKind, Pid};
use crate::process_lookup::{find_process_by_name, process_info};

/// One probe to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub symbol: String,
    pub kind: AttachKind,
}

/// Everything the CLI needs to run a session, validated
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pid: Pid,
    pub exe: PathBuf,
    pub command: String,
    /// Return probes first, so calls are armed before entries can fire
    pub probes: Vec<ProbeRequest>,
    pub buffer_capacity: usize,
    pub bpf_object: PathBuf,
    pub format: OutputFormat,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
    pub capture_args: bool,
    pub quiet: bool,
}

impl SessionConfig {
    /// Resolve the target process and validate the probe list
    ///
    /// # Errors
    /// Returns an error if no target or no probe was given, or the target
    /// cannot be found
    pub fn from_args(args: &Args) -> Result<Self> {
        let probes = probe_plan(args);
        if probes.is_empty() {
            bail!(
                "Missing required argument: at least one --entry, --return or --call SYMBOL\n\n\
                 Run 'callscope --help' for more options"
            );
        }

        let info = match (&args.process, args.pid) {
            (Some(name), _) => find_process_by_name(name)?,
            (None, Some(pid)) => process_info(Pid(pid))?,
            (None, None) => bail!(
                "Missing required argument: PROCESS or --pid\n\n\
                 Usage:\n  \
                 callscope my-app --call SYMBOL        Find the process by name\n  \
                 callscope --pid 1234 --call SYMBOL    Explicit PID\n\n\
                 Run 'callscope --help' for more options"
            ),
        };

        Ok(Self {
            pid: info.pid,
            exe: info.exe_path,
            command: info.command,
            probes,
            buffer_capacity: args.buffer_capacity,
            bpf_object: args.bpf_object.clone(),
            format: args.format,
            output: args.output.clone(),
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            capture_args: !args.no_args,
            quiet: args.quiet,
        })
    }
}

/// Flatten `--entry`, `--return` and `--call` into attach requests
///
/// Each (symbol, kind) appears once; return probes come first.
#[must_use]
pub fn probe_plan(args: &Args) -> Vec<ProbeRequest> {
    let returns = args.ret.iter().chain(&args.call).map(|s| (s, AttachKind::Return));
    let entries = args.entry.iter().chain(&args.call).map(|s| (s, AttachKind::Entry));

    let mut plan: Vec<ProbeRequest> = Vec::new();
    for (symbol, kind) in returns.chain(entries) {
        let request = ProbeRequest { symbol: symbol.clone(), kind };
        if !plan.contains(&request) {
            plan.push(request);
        }
    }
    plan
}

//! # callscope - Main Entry Point
//!
//! Resolve the target, load the probe object, attach the requested probes
//! and stream call records until the target exits, the duration runs out,
//! or Ctrl+C.

// Time conversions lose precision for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callscope::cli::{display_statistics, print_summary, Args, OutputFormat, SessionConfig};
use callscope::preflight::run_preflight_checks;
use callscope::probes::ebpf_backend::KernelConfig;
use callscope::probes::{EbpfBackend, ProbeManager, ProbeSpec};
use callscope::session::Session;
use callscope::sink::{JsonLinesSink, Sink, TextSink};
use callscope::symbolization::ElfSymbolResolver;
use callscope::transport;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Argument words shown in text output
const TEXT_ARG_WORDS: usize = 3;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Where records go: text or JSON, to a file or the terminal
fn build_sink(config: &SessionConfig) -> Result<Box<dyn Sink>> {
    let arg_words = if config.capture_args { TEXT_ARG_WORDS } else { 0 };

    let sink: Box<dyn Sink> = match (&config.output, config.format) {
        (Some(path), format) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            let writer = BufWriter::new(file);
            match format {
                OutputFormat::Text => Box::new(TextSink::new(writer, arg_words)),
                OutputFormat::Json => Box::new(JsonLinesSink::new(writer)),
            }
        }
        (None, OutputFormat::Text) => Box::new(TextSink::new(std::io::stdout(), arg_words)),
        (None, OutputFormat::Json) => Box::new(JsonLinesSink::new(std::io::stdout())),
    };
    Ok(sink)
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let config = SessionConfig::from_args(&args)?;
    let quiet = config.quiet;

    run_preflight_checks(&config.bpf_object, config.pid)?;

    if !quiet {
        println!("callscope v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {} ({})", config.exe.display(), config.command);
        println!("pid: {}", config.pid);
    }

    // ── Probe object and transport ──────────────────────────────────────
    let (buffer, drain) = transport::bounded(config.buffer_capacity);
    let backend = EbpfBackend::load(
        &config.bpf_object,
        Arc::clone(&buffer),
        KernelConfig { capture_args: config.capture_args },
    )
    .with_context(|| format!("Failed to load probe object {}", config.bpf_object.display()))?;

    let manager = ProbeManager::new(backend, Arc::new(ElfSymbolResolver::new()));
    let mut session = Session::start(manager, drain, build_sink(&config)?)?;

    // ── Attach: return probes first, so calls are armed before entries fire
    let mut handles = Vec::with_capacity(config.probes.len());
    let mut first_failure = None;
    for request in &config.probes {
        match session.attach(ProbeSpec::new(config.pid, request.symbol.as_str(), request.kind)) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!("⚠️  Could not attach {} probe on {}: {e}", request.kind, request.symbol);
                first_failure.get_or_insert(e);
            }
        }
    }

    if handles.is_empty() {
        let summary = session.finish()?;
        info!("Nothing attached, {} events seen", summary.accepted);
        match first_failure {
            Some(e) => bail!("No probe could be attached: {e}"),
            None => bail!("No probe could be attached"),
        }
    }

    if !quiet {
        println!("probes: {} attached", handles.len());
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let tracing_start = Instant::now();
    let mut stats_timer = Instant::now();
    let proc_path = format!("/proc/{}", config.pid);

    // Track why we exited the loop
    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = config.duration {
            if tracing_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        // The traps die with the target; flush what it left behind
        if !std::path::Path::new(&proc_path).exists() {
            session.process_exited(config.pid);
            handles.clear();
            exit_reason = "process exited";
            break;
        }

        if !quiet && stats_timer.elapsed() > Duration::from_secs(10) {
            display_statistics(session.buffer(), session.manager().backend().kernel_dropped());
            stats_timer = Instant::now();
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    for handle in handles {
        if let Err(e) = session.detach(handle) {
            warn!("⚠️  Detach failed: {e}");
        }
    }

    let summary = session.finish()?;
    if !quiet {
        print_summary(exit_reason, &summary);
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel-side probe programs
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
    /// Build the demo target the CLI instruments
    BuildDemo,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
        Cmd::BuildDemo => build_demo()?,
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects, so the
    // kernel object is always built in release mode.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("callscope-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Object: target/{target}/release/callscope");

    Ok(())
}

fn build_demo() -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "callscope", "--example", "dummy-tls-client"])
        .status()
        .context("Failed to build demo target")?;

    if !status.success() {
        anyhow::bail!("Failed to build demo target");
    }

    println!("✓ Demo target built: target/release/examples/dummy-tls-client");
    Ok(())
}

//! Build helper for udp-flood.
//!
//! Compiles the XDP program for the BPF target and drives the userspace build.
//!
//! Usage:
//!   cargo xtask build-ebpf-xdp [--release]     # Build the XDP program
//!   cargo xtask build [--release]              # Build XDP program + udp-flood
//!   cargo xtask run [--release] -- <args>      # Build everything and run udp-flood

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the XDP program only (for AF_XDP mode).
    BuildEbpfXdp {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build the XDP program and the udp-flood binary.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run udp-flood.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Arguments passed through to udp-flood.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = workspace_root()?;

    match cli {
        Cli::BuildEbpfXdp { release } => {
            build_ebpf_xdp(&root, release)?;
        }
        Cli::Build { release } => {
            build_ebpf_xdp(&root, release)?;
            build_userspace(&root, release)?;
        }
        Cli::Run { release, args } => {
            build_ebpf_xdp(&root, release)?;
            build_userspace(&root, release)?;
            run_flood(&root, release, &args)?;
        }
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask manifest has no parent directory")
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Build the XDP program and copy the object to `target/udp-flood-ebpf-xdp`.
///
/// This requires:
/// - `bpf-linker` installed: `cargo install bpf-linker`
/// - Nightly Rust for the BPF target: `rustup toolchain install nightly`
/// - The `rust-src` component: `rustup component add rust-src --toolchain nightly`
fn build_ebpf_xdp(root: &Path, release: bool) -> Result<()> {
    let xdp_dir = root.join("udp-flood-ebpf-xdp");

    println!("=> Building XDP program...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&xdp_dir)
        .arg("+nightly")
        .arg("build")
        .arg("--target=bpfel-unknown-none")
        .arg("-Z")
        .arg("build-std=core");
    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for the XDP program")?;
    if !status.success() {
        bail!("XDP program build failed");
    }

    let object = xdp_dir
        .join("target")
        .join("bpfel-unknown-none")
        .join(profile(release))
        .join("udp-flood-ebpf-xdp");
    let dest = root.join("target").join("udp-flood-ebpf-xdp");
    std::fs::create_dir_all(root.join("target")).context("creating target directory")?;

    std::fs::copy(&object, &dest).with_context(|| {
        format!(
            "copying XDP object from {} to {}",
            object.display(),
            dest.display()
        )
    })?;
    println!("   XDP program: {}", dest.display());
    Ok(())
}

fn build_userspace(root: &Path, release: bool) -> Result<()> {
    println!("=> Building udp-flood...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(root).arg("build").arg("-p").arg("udp-flood");
    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for udp-flood")?;
    if !status.success() {
        bail!("udp-flood build failed");
    }
    Ok(())
}

/// Run udp-flood with the freshly built XDP program. Raw and AF_XDP sockets
/// need CAP_NET_RAW / CAP_NET_ADMIN, so this is usually invoked under sudo.
fn run_flood(root: &Path, release: bool, extra_args: &[String]) -> Result<()> {
    let binary = root.join("target").join(profile(release)).join("udp-flood");
    let xdp_program = root.join("target").join("udp-flood-ebpf-xdp");

    println!("=> Running udp-flood...");

    let mut cmd = Command::new(&binary);
    // The program is only used with -X; the flag is harmless otherwise.
    cmd.arg("--xdp-program").arg(&xdp_program);
    cmd.args(extra_args);

    let status = cmd.status().context("running udp-flood")?;
    if !status.success() {
        bail!("udp-flood exited with {}", status);
    }
    Ok(())
}

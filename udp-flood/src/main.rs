//! udp-flood: high-rate IPv4/UDP transmit engine for load and stress testing.
//!
//! Builds one packet template per (interface, target) pair and replays it for
//! a fixed duration from one pinned thread per (core, interface, target),
//! using either:
//!   - raw-socket: IPPROTO_RAW + IP_HDRINCL `sendto` loop (portable)
//!   - af_xdp:     zero-copy UMEM arena + TX ring (kernel bypass)

mod backend;
mod checksum;
mod config;
mod netif;
mod orchestrator;
mod packet;
mod xdp_program;
mod xsk;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use backend::BackendKind;
use config::{Config, ConfigError, MAX_RATE_PPS};
use orchestrator::UnitOutcome;
use xdp_program::XdpProgram;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Flags left unset fall back to the YAML file (if any), then to defaults.
#[derive(Parser, Debug)]
#[command(
    name = "udp-flood",
    about = "High-rate UDP packet generator with raw-socket and AF_XDP backends",
    version
)]
struct Cli {
    /// Destination IPv4 addresses.
    #[arg(value_name = "TARGET", conflicts_with = "config")]
    targets: Vec<String>,

    /// UDP destination port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Run length in seconds.
    #[arg(short = 't', long = "duration")]
    duration_secs: Option<u64>,

    /// Transmit interface. Repeat for several; autodetected when omitted.
    #[arg(short, long = "interface")]
    interfaces: Vec<String>,

    /// Payload length in bytes (1-1400).
    #[arg(short = 'd', long)]
    payload_size: Option<usize>,

    /// Byte the payload is filled with (decimal, 0x-hex or a single character).
    #[arg(long, value_parser = parse_byte)]
    payload_byte: Option<u8>,

    /// Literal payload text. Overrides --payload-size and --payload-byte.
    #[arg(long)]
    payload_text: Option<String>,

    /// UDP source port.
    #[arg(long)]
    source_port: Option<u16>,

    /// IPv4 source address. Defaults to the interface's address.
    #[arg(long)]
    source: Option<String>,

    /// Advisory packets/sec ceiling per execution unit.
    #[arg(short, long)]
    rate: Option<u64>,

    /// Use the AF_XDP zero-copy backend.
    #[arg(short = 'X', long)]
    zero_copy: bool,

    /// AF_XDP arena frame count (power of two).
    #[arg(long)]
    frame_count: Option<u32>,

    /// AF_XDP arena frame size (2048 or 4096).
    #[arg(long)]
    frame_size: Option<u32>,

    /// Execution units per (interface, target) pair. Defaults to the core count.
    #[arg(long)]
    threads: Option<usize>,

    /// Ethernet destination for AF_XDP frames. Defaults to broadcast.
    #[arg(long)]
    dst_mac: Option<String>,

    /// Compiled XDP program to attach in AF_XDP mode.
    #[arg(long)]
    xdp_program: Option<PathBuf>,

    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Layer the flags that were given over `base`.
    fn apply(&self, mut base: Config) -> Config {
        if !self.targets.is_empty() {
            base.targets = self.targets.clone();
        }
        if !self.interfaces.is_empty() {
            base.interfaces = self.interfaces.clone();
        }
        if let Some(port) = self.port {
            base.port = port;
        }
        if let Some(secs) = self.duration_secs {
            base.duration_secs = secs;
        }
        if let Some(size) = self.payload_size {
            base.payload_size = size;
        }
        if let Some(byte) = self.payload_byte {
            base.payload_byte = byte;
        }
        if self.payload_text.is_some() {
            base.payload_text = self.payload_text.clone();
        }
        if let Some(port) = self.source_port {
            base.source_port = port;
        }
        if self.source.is_some() {
            base.source = self.source.clone();
        }
        if self.rate.is_some() {
            base.rate = self.rate;
        }
        if self.zero_copy {
            base.zero_copy = true;
        }
        if let Some(count) = self.frame_count {
            base.frame_count = count;
        }
        if let Some(size) = self.frame_size {
            base.frame_size = size;
        }
        if self.threads.is_some() {
            base.threads = self.threads;
        }
        if self.dst_mac.is_some() {
            base.dst_mac = self.dst_mac.clone();
        }
        base
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|e| format!("invalid hex byte '{}': {}", s, e));
    }
    if let Ok(n) = s.parse::<u8>() {
        return Ok(n);
    }
    match s.as_bytes() {
        [c] => Ok(*c),
        _ => Err(format!("'{}' is not a byte (use 65, 0x41 or A)", s)),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the per-unit summary lines.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(config_err) = e.downcast_ref::<ConfigError>() {
                eprintln!("udp-flood: configuration error: {}", config_err);
                ExitCode::from(2)
            } else {
                eprintln!("udp-flood: {:#}", e);
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting udp-flood");

    let base = match &cli.config {
        Some(path) => Config::load(path).context("loading configuration")?,
        None => Config::default(),
    };
    let mut config = cli.apply(base);
    config.validate()?;

    if config.interfaces.is_empty() {
        let first: Ipv4Addr = config.targets[0]
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidTarget(config.targets[0].clone()))?;
        let iface = netif::detect_interface(first)
            .with_context(|| format!("autodetecting interface for {}", first))?;
        info!(interface = %iface, target = %first, "autodetected transmit interface");
        config.interfaces.push(iface);
    }
    let config = config;

    if config.rate_clamped() {
        warn!(
            requested = config.rate.unwrap_or_default(),
            max = MAX_RATE_PPS,
            "rate cap clamped to maximum"
        );
    }

    let mut kind = if config.zero_copy {
        BackendKind::ZeroCopy
    } else {
        BackendKind::Conventional
    };
    if kind == BackendKind::ZeroCopy && !xsk::supported() {
        warn!("AF_XDP sockets are not supported by this kernel; falling back to raw sockets");
        println!("[!] AF_XDP unavailable, using raw-socket backend");
        kind = BackendKind::Conventional;
    }

    // The XDP program is attached once per interface, before any unit starts.
    let mut attach_errors = HashMap::new();
    let mut program = None;
    if kind == BackendKind::ZeroCopy {
        if let Some(path) = &cli.xdp_program {
            let bytes = std::fs::read(path).with_context(|| {
                format!(
                    "reading XDP program from {}. Build it with: cargo xtask build-ebpf-xdp",
                    path.display()
                )
            })?;
            let mut prog = XdpProgram::load(&bytes).context("loading XDP program")?;
            for iface in &config.interfaces {
                if let Err(e) = prog.attach(iface) {
                    error!(interface = %iface, error = format!("{:#}", e), "XDP attach failed; units on this interface will not run");
                    attach_errors.insert(iface.clone(), format!("{:#}", e));
                }
            }
            info!(interfaces = prog.attached().len(), "XDP program ready");
            program = Some(prog);
        }
    }

    let contexts = orchestrator::plan(&config, kind, &attach_errors)?;
    info!(
        duration_secs = config.duration_secs,
        rate = ?config.rate_limit(),
        "launching execution units"
    );

    let reports = orchestrator::run(contexts, config.duration());

    let mut total_sent = 0u64;
    let mut completed = 0usize;
    for report in &reports {
        println!("{}", report);
        if matches!(report.outcome, UnitOutcome::Completed(_)) {
            completed += 1;
        }
        total_sent += report.sent();
    }
    println!(
        "[=] units={} completed={} failed={} total_sent={}",
        reports.len(),
        completed,
        reports.len() - completed,
        total_sent
    );

    if let Some(prog) = program {
        prog.detach();
    }

    info!(total_sent, "udp-flood finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_forms() {
        assert_eq!(parse_byte("65"), Ok(65));
        assert_eq!(parse_byte("0x41"), Ok(0x41));
        assert_eq!(parse_byte("0XfF"), Ok(0xff));
        assert_eq!(parse_byte("A"), Ok(b'A'));
        assert!(parse_byte("256").is_err());
        assert!(parse_byte("AB").is_err());
        assert!(parse_byte("0xzz").is_err());
    }

    #[test]
    fn test_cli_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "udp-flood", "-p", "9999", "-t", "1", "-i", "eth0", "-i", "eth1", "-d", "128",
            "--threads", "2", "-X", "203.0.113.5", "203.0.113.6",
        ])
        .unwrap();
        let config = cli.apply(Config::default());

        assert_eq!(config.port, 9999);
        assert_eq!(config.duration_secs, 1);
        assert_eq!(config.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(config.targets, vec!["203.0.113.5", "203.0.113.6"]);
        assert_eq!(config.payload_size, 128);
        assert_eq!(config.threads, Some(2));
        assert!(config.zero_copy);
        assert_eq!(config.source_port, config::DEFAULT_SOURCE_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_keeps_file_values_when_unset() {
        let base = Config {
            port: 5000,
            targets: vec!["198.51.100.1".to_string()],
            rate: Some(1000),
            ..Config::default()
        };
        let cli = Cli::try_parse_from(["udp-flood", "-t", "3"]).unwrap();
        let config = cli.apply(base);
        assert_eq!(config.port, 5000);
        assert_eq!(config.duration_secs, 3);
        assert_eq!(config.rate, Some(1000));
        assert_eq!(config.targets, vec!["198.51.100.1"]);
    }

    #[test]
    fn test_config_conflicts_with_targets() {
        assert!(Cli::try_parse_from(["udp-flood", "--config", "run.yaml", "203.0.113.5"]).is_err());
    }

    #[test]
    fn test_oversized_payload_is_config_error() {
        let cli = Cli::try_parse_from(["udp-flood", "-p", "9999", "-d", "1500", "203.0.113.5"]).unwrap();
        let err = cli.apply(Config::default()).validate().unwrap_err();
        assert_eq!(err, ConfigError::PayloadSize { len: 1500, max: 1400 });
    }
}

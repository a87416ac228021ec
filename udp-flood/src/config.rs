//! Run configuration.
//!
//! Built once from the command line or a YAML file, validated, and then only
//! ever borrowed. Nothing mutates a `Config` after `validate()` succeeds.

use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::packet::{MacAddr, ETH_HEADER_LEN, HEADER_OVERHEAD, MAX_PAYLOAD};

// ---------------------------------------------------------------------------
// Limits and Defaults
// ---------------------------------------------------------------------------

/// Ceiling applied to the per-unit advisory rate.
pub const MAX_RATE_PPS: u64 = 10_000_000;

pub const DEFAULT_DURATION_SECS: u64 = 10;
pub const DEFAULT_PAYLOAD_SIZE: usize = 64;
pub const DEFAULT_PAYLOAD_BYTE: u8 = b'A';
pub const DEFAULT_SOURCE_PORT: u16 = 12345;
pub const DEFAULT_FRAME_COUNT: u32 = 4096;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;

const MIN_FRAME_COUNT: u32 = 64;
const MAX_FRAME_COUNT: u32 = 1 << 20;

/// Linux IFNAMSIZ minus the terminating NUL.
const MAX_IFNAME_LEN: usize = 15;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("destination port must be greater than 0")]
    MissingPort,

    #[error("duration must be greater than 0 seconds")]
    ZeroDuration,

    #[error("at least one target address is required")]
    NoTargets,

    #[error("target '{0}' is not a valid IPv4 address")]
    InvalidTarget(String),

    #[error("source '{0}' is not a valid IPv4 address")]
    InvalidSource(String),

    #[error("payload must be 1-{max} bytes, got {len}")]
    PayloadSize { len: usize, max: usize },

    #[error("invalid interface name '{name}': {reason}")]
    InvalidInterfaceName { name: String, reason: &'static str },

    #[error("frame count {0} must be a power of two between 64 and 1048576")]
    FrameCount(u32),

    #[error("frame size {0} must be 2048 or 4096")]
    FrameSize(u32),

    #[error("frame size {frame_size} cannot hold a {needed}-byte frame")]
    FrameTooSmall { frame_size: u32, needed: usize },

    #[error("thread multiplier must be greater than 0")]
    ZeroThreads,

    #[error("invalid destination MAC: {0}")]
    InvalidMac(String),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// UDP destination port.
    pub port: u16,
    /// Run length per unit, in seconds.
    pub duration_secs: u64,
    /// Advisory packets/sec ceiling per unit.
    pub rate: Option<u64>,
    /// Transmit interfaces. Empty means "autodetect from the first target".
    pub interfaces: Vec<String>,
    /// Destination IPv4 addresses.
    pub targets: Vec<String>,
    /// Explicit IPv4 source address.
    pub source: Option<String>,
    pub source_port: u16,
    pub payload_size: usize,
    /// Fill byte for a payload of `payload_size` bytes.
    pub payload_byte: u8,
    /// Literal payload; overrides `payload_size` and `payload_byte`.
    pub payload_text: Option<String>,
    pub zero_copy: bool,
    pub frame_count: u32,
    pub frame_size: u32,
    /// Units per (interface, target) pair. `None` means one per logical core.
    pub threads: Option<usize>,
    /// Ethernet destination for zero-copy frames. Defaults to broadcast.
    pub dst_mac: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            duration_secs: DEFAULT_DURATION_SECS,
            rate: None,
            interfaces: Vec::new(),
            targets: Vec::new(),
            source: None,
            source_port: DEFAULT_SOURCE_PORT,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            payload_byte: DEFAULT_PAYLOAD_BYTE,
            payload_text: None,
            zero_copy: false,
            frame_count: DEFAULT_FRAME_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            threads: None,
            dst_mac: None,
        }
    }
}

impl Config {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Check every field. Interfaces may still be empty here; they are
    /// resolved by autodetection before launch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::MissingPort);
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for target in &self.targets {
            target
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidTarget(target.clone()))?;
        }
        if let Some(source) = &self.source {
            source
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidSource(source.clone()))?;
        }

        let payload_len = self.payload_len();
        if payload_len == 0 || payload_len > MAX_PAYLOAD {
            return Err(ConfigError::PayloadSize {
                len: payload_len,
                max: MAX_PAYLOAD,
            });
        }

        for name in &self.interfaces {
            validate_interface_name(name)?;
        }

        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }

        if self.zero_copy {
            if !self.frame_count.is_power_of_two()
                || !(MIN_FRAME_COUNT..=MAX_FRAME_COUNT).contains(&self.frame_count)
            {
                return Err(ConfigError::FrameCount(self.frame_count));
            }
            if self.frame_size != 2048 && self.frame_size != 4096 {
                return Err(ConfigError::FrameSize(self.frame_size));
            }
            let needed = ETH_HEADER_LEN + HEADER_OVERHEAD + payload_len;
            if needed > self.frame_size as usize {
                return Err(ConfigError::FrameTooSmall {
                    frame_size: self.frame_size,
                    needed,
                });
            }
            if let Some(mac) = &self.dst_mac {
                mac.parse::<MacAddr>().map_err(ConfigError::InvalidMac)?;
            }
        }

        Ok(())
    }

    /// Payload bytes appended after the UDP header.
    pub fn payload(&self) -> Cow<'_, [u8]> {
        match &self.payload_text {
            Some(text) => Cow::Borrowed(text.as_bytes()),
            None => Cow::Owned(vec![self.payload_byte; self.payload_size]),
        }
    }

    fn payload_len(&self) -> usize {
        self.payload_text
            .as_ref()
            .map_or(self.payload_size, |text| text.len())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Units launched for each (interface, target) pair.
    pub fn thread_multiplier(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus)
    }

    /// Rate cap clamped to `MAX_RATE_PPS`. A cap of 0 means unlimited.
    pub fn rate_limit(&self) -> Option<u64> {
        self.rate
            .filter(|&pps| pps > 0)
            .map(|pps| pps.min(MAX_RATE_PPS))
    }

    /// Whether the requested rate exceeds the internal ceiling.
    pub fn rate_clamped(&self) -> bool {
        self.rate.is_some_and(|pps| pps > MAX_RATE_PPS)
    }

    /// Explicit source address, if one was configured.
    pub fn source_addr(&self) -> Option<Ipv4Addr> {
        self.source.as_deref().and_then(|s| s.trim().parse().ok())
    }

    pub fn dst_mac(&self) -> MacAddr {
        self.dst_mac
            .as_deref()
            .and_then(|mac| mac.parse().ok())
            .unwrap_or(MacAddr::BROADCAST)
    }
}

fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        "interface name cannot be empty"
    } else if name.len() > MAX_IFNAME_LEN {
        "interface name too long (max 15 chars)"
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
    {
        "interface name contains invalid characters"
    } else {
        return Ok(());
    };

    Err(ConfigError::InvalidInterfaceName {
        name: name.to_string(),
        reason,
    })
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

//! Transmit backends.
//!
//! Both variants take an execution context and a duration and return how
//! many packets they handed to the kernel. The orchestrator never looks
//! inside; it only calls [`Backend::run`].

pub mod conventional;
pub mod zero_copy;

use std::fmt;
use std::time::Duration;

use anyhow::Result;

use crate::orchestrator::ExecutionContext;

pub use conventional::ConventionalBackend;
pub use zero_copy::ZeroCopyBackend;

/// Which transmit path a unit uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Conventional,
    ZeroCopy,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Conventional => "raw-socket",
            BackendKind::ZeroCopy => "af_xdp",
        })
    }
}

#[derive(Debug)]
pub enum Backend {
    Conventional(ConventionalBackend),
    ZeroCopy(ZeroCopyBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Conventional(_) => BackendKind::Conventional,
            Backend::ZeroCopy(_) => BackendKind::ZeroCopy,
        }
    }

    /// Transmit `ctx.template` until `duration` has elapsed.
    ///
    /// An `Err` means setup failed and nothing was sent. Individual send
    /// failures are never errors; they only lower the count.
    pub fn run(&self, ctx: &ExecutionContext, duration: Duration) -> Result<SendStats> {
        match self {
            Backend::Conventional(backend) => backend.run(ctx, duration),
            Backend::ZeroCopy(backend) => backend.run(ctx, duration),
        }
    }
}

/// What one unit's send loop achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    /// Packets handed to the kernel.
    pub sent: u64,
    /// Send calls that failed (raw-socket path only).
    pub errors: u64,
    /// Wall-clock time spent in the send loop.
    pub elapsed: Duration,
}

impl SendStats {
    pub fn pps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sent as f64 / secs
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Coarse rate cap: allows `1 + rate * elapsed` packets by time `elapsed`.
/// No smoothing; bursts up to the allowance are fine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pacer {
    rate: Option<u64>,
}

impl Pacer {
    pub(crate) fn new(rate: Option<u64>) -> Self {
        Self { rate }
    }

    /// How many more packets may go out right now.
    #[inline]
    pub(crate) fn budget(&self, elapsed: Duration, sent: u64) -> u64 {
        match self.rate {
            None => u64::MAX,
            Some(rate) => {
                let allowed = 1 + (rate as u128 * elapsed.as_nanos() / 1_000_000_000) as u64;
                allowed.saturating_sub(sent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_pacer() {
        let pacer = Pacer::new(None);
        assert_eq!(pacer.budget(Duration::ZERO, 1_000_000), u64::MAX);
    }

    #[test]
    fn test_pacer_budget() {
        let pacer = Pacer::new(Some(1000));
        assert_eq!(pacer.budget(Duration::ZERO, 0), 1);
        assert_eq!(pacer.budget(Duration::ZERO, 1), 0);
        assert_eq!(pacer.budget(Duration::from_millis(500), 0), 501);
        assert_eq!(pacer.budget(Duration::from_millis(500), 400), 101);
        assert_eq!(pacer.budget(Duration::from_secs(1), 5000), 0);
    }

    #[test]
    fn test_pps() {
        let stats = SendStats {
            sent: 500,
            errors: 0,
            elapsed: Duration::from_millis(250),
        };
        assert_eq!(stats.pps(), 2000.0);
        assert_eq!(SendStats::default().pps(), 0.0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(BackendKind::Conventional.to_string(), "raw-socket");
        assert_eq!(BackendKind::ZeroCopy.to_string(), "af_xdp");
    }
}

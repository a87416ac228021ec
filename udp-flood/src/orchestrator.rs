//! Fans transmit work out over (core, interface, target) combinations.
//!
//! One OS thread per execution context, each owning its context outright.
//! Units share nothing mutable; the orchestrator only joins them and
//! collects their reports.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendKind, ConventionalBackend, SendStats, ZeroCopyBackend};
use crate::config::{num_cpus, Config};
use crate::netif;
use crate::packet::PacketTemplate;

// ---------------------------------------------------------------------------
// Execution Context
// ---------------------------------------------------------------------------

/// Everything one execution unit needs. Moved into the unit's thread.
#[derive(Debug)]
pub struct ExecutionContext {
    pub id: usize,
    pub core: usize,
    pub interface: String,
    pub target: Ipv4Addr,
    pub template: PacketTemplate,
    pub backend: Backend,
}

/// Build one context per (interface, target, core) triple.
///
/// Templates are built once per (interface, target) pair and cloned into the
/// units that share it. Cores cycle `0..thread_multiplier`. `attach_errors`
/// maps interfaces whose XDP program failed to attach to the failure text.
pub fn plan(
    config: &Config,
    kind: BackendKind,
    attach_errors: &HashMap<String, String>,
) -> Result<Vec<ExecutionContext>> {
    if config.interfaces.is_empty() {
        bail!("no transmit interface configured");
    }
    if config.targets.is_empty() {
        bail!("no targets configured");
    }

    let multiplier = config.thread_multiplier();
    let rate = config.rate_limit();
    let mut contexts =
        Vec::with_capacity(multiplier * config.interfaces.len() * config.targets.len());

    for interface in &config.interfaces {
        let source = source_address(config, interface);
        let mut next_queue = 0u32;

        for target in &config.targets {
            let template = PacketTemplate::build(config, source, target)
                .with_context(|| format!("building packet for {} via {}", target, interface))?;

            for core in 0..multiplier {
                let backend = match kind {
                    BackendKind::Conventional => {
                        Backend::Conventional(ConventionalBackend::new(rate))
                    }
                    BackendKind::ZeroCopy => {
                        let queue_id = next_queue;
                        next_queue += 1;
                        Backend::ZeroCopy(ZeroCopyBackend {
                            frame_count: config.frame_count,
                            frame_size: config.frame_size,
                            dst_mac: config.dst_mac(),
                            queue_id,
                            rate,
                            attach_error: attach_errors.get(interface).cloned(),
                        })
                    }
                };

                contexts.push(ExecutionContext {
                    id: contexts.len(),
                    core,
                    interface: interface.clone(),
                    target: *template.destination().ip(),
                    template: template.clone(),
                    backend,
                });
            }
        }

        if kind == BackendKind::ZeroCopy {
            let available = netif::tx_queue_count(interface);
            if let Some(limit) = queue_shortage(next_queue, available) {
                warn!(
                    interface = %interface,
                    assigned = next_queue,
                    queues = limit,
                    "more AF_XDP units than TX queues; units past the last queue will fail setup"
                );
            }
        }
    }

    info!(
        units = contexts.len(),
        multiplier,
        interfaces = config.interfaces.len(),
        targets = config.targets.len(),
        backend = %kind,
        "planned execution units"
    );
    Ok(contexts)
}

/// Queue limit when `assigned` queue ids exceed it. An interface whose queue
/// count is unknown is assumed to have one queue per logical core.
fn queue_shortage(assigned: u32, available: Option<u32>) -> Option<u32> {
    let limit = available.unwrap_or_else(|| num_cpus() as u32);
    (assigned > limit).then_some(limit)
}

/// Explicit source, else the interface's own IPv4 address, else 0.0.0.0.
fn source_address(config: &Config, interface: &str) -> Ipv4Addr {
    if let Some(source) = config.source_addr() {
        return source;
    }
    match netif::interface_ipv4(interface) {
        Ok(Some(addr)) => addr,
        Ok(None) => {
            debug!(interface, "interface has no IPv4 address; kernel will pick the source");
            Ipv4Addr::UNSPECIFIED
        }
        Err(e) => {
            warn!(interface, error = %e, "could not read interface address; kernel will pick the source");
            Ipv4Addr::UNSPECIFIED
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed(SendStats),
    SetupFailed(String),
}

/// Final word from one execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub id: usize,
    pub core: usize,
    pub interface: String,
    pub target: Ipv4Addr,
    pub backend: BackendKind,
    pub outcome: UnitOutcome,
}

impl UnitReport {
    fn new(ctx: &ExecutionContext, outcome: UnitOutcome) -> Self {
        Self {
            id: ctx.id,
            core: ctx.core,
            interface: ctx.interface.clone(),
            target: ctx.target,
            backend: ctx.backend.kind(),
            outcome,
        }
    }

    /// Packets sent; a failed setup counts as zero.
    pub fn sent(&self) -> u64 {
        match &self.outcome {
            UnitOutcome::Completed(stats) => stats.sent,
            UnitOutcome::SetupFailed(_) => 0,
        }
    }
}

impl fmt::Display for UnitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            UnitOutcome::Completed(stats) => write!(
                f,
                "[+] unit={} core={} iface={} target={} backend={} sent={} errors={} elapsed={:.2}s pps={:.0}",
                self.id,
                self.core,
                self.interface,
                self.target,
                self.backend,
                stats.sent,
                stats.errors,
                stats.elapsed.as_secs_f64(),
                stats.pps(),
            ),
            UnitOutcome::SetupFailed(reason) => write!(
                f,
                "[-] unit={} core={} iface={} target={} backend={} sent=0 setup failed: {}",
                self.id, self.core, self.interface, self.target, self.backend, reason,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

/// Start one pinned thread per context, wait for all of them, and return
/// their reports in context order. A failing unit never affects its siblings.
pub fn run(contexts: Vec<ExecutionContext>, duration: Duration) -> Vec<UnitReport> {
    let mut handles = Vec::with_capacity(contexts.len());
    let mut reports = Vec::with_capacity(contexts.len());

    for ctx in contexts {
        // Kept in case the thread cannot be spawned or panics.
        let fallback = UnitReport::new(&ctx, UnitOutcome::SetupFailed(String::new()));
        let spawned = thread::Builder::new()
            .name(format!("tx-{}-c{}", ctx.interface, ctx.core))
            .spawn(move || run_unit(ctx, duration));

        match spawned {
            Ok(handle) => handles.push((fallback, handle)),
            Err(e) => {
                error!(unit = fallback.id, error = %e, "failed to spawn execution unit");
                reports.push(UnitReport {
                    outcome: UnitOutcome::SetupFailed(format!("spawning thread: {}", e)),
                    ..fallback
                });
            }
        }
    }

    for (fallback, handle) in handles {
        let report = handle.join().unwrap_or_else(|_| {
            error!(unit = fallback.id, "execution unit panicked");
            UnitReport {
                outcome: UnitOutcome::SetupFailed("execution unit panicked".to_string()),
                ..fallback
            }
        });
        reports.push(report);
    }

    reports.sort_by_key(|r| r.id);
    reports
}

/// Body of one execution unit: pin, transmit, report.
fn run_unit(ctx: ExecutionContext, duration: Duration) -> UnitReport {
    if core_affinity::set_for_current(core_affinity::CoreId { id: ctx.core }) {
        debug!(unit = ctx.id, core = ctx.core, "pinned to CPU core");
    } else {
        warn!(unit = ctx.id, core = ctx.core, "could not pin to CPU core; running unpinned");
    }

    debug!(unit = ctx.id, backend = %ctx.backend.kind(), "unit running");
    let outcome = match ctx.backend.run(&ctx, duration) {
        Ok(stats) => UnitOutcome::Completed(stats),
        Err(e) => {
            error!(unit = ctx.id, interface = %ctx.interface, error = format!("{:#}", e), "unit setup failed");
            UnitOutcome::SetupFailed(format!("{:#}", e))
        }
    };
    UnitReport::new(&ctx, outcome)
}

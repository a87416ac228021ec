//! Optional XDP program attached to transmit interfaces in AF_XDP mode.
//!
//! TX-only AF_XDP sockets work without it, but some drivers only enter
//! zero-copy mode once an XDP program is present on the interface. The
//! program itself passes every received frame up to the kernel.

use anyhow::{Context, Result};
use aya::maps::PerCpuArray;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{info, warn};

/// Program symbol exported by the udp-flood-ebpf-xdp object.
const PROGRAM_NAME: &str = "udp_flood_xdp";

/// A loaded XDP program and the interfaces it is attached to.
///
/// Dropping the value detaches the program everywhere.
pub struct XdpProgram {
    bpf: Ebpf,
    attached: Vec<String>,
}

impl XdpProgram {
    /// Load the program from its ELF object and verify it with the kernel.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading XDP eBPF object")?;

        let program: &mut Xdp = bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("XDP program '{}' not found", PROGRAM_NAME))?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;
        program.load().context("loading XDP program into the kernel")?;

        Ok(Self {
            bpf,
            attached: Vec::new(),
        })
    }

    /// Attach to `iface`. Tries native (driver) mode first, then SKB mode.
    pub fn attach(&mut self, iface: &str) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("XDP program '{}' not found", PROGRAM_NAME))?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        match program.attach(iface, XdpFlags::default()) {
            Ok(_link_id) => {
                info!(interface = iface, mode = "native", "attached XDP program");
            }
            Err(native_err) => {
                warn!(
                    interface = iface,
                    error = %native_err,
                    "native XDP attach failed, trying SKB mode"
                );
                program.attach(iface, XdpFlags::SKB_MODE).with_context(|| {
                    format!(
                        "attaching XDP to {} (native and SKB both failed; native error: {})",
                        iface, native_err
                    )
                })?;
                info!(interface = iface, mode = "skb", "attached XDP program");
            }
        }

        self.attached.push(iface.to_string());
        Ok(())
    }

    pub fn attached(&self) -> &[String] {
        &self.attached
    }

    /// Frames the program has passed to the kernel, summed over all CPUs.
    pub fn passed_frames(&self) -> Result<u64> {
        let counters: PerCpuArray<_, u64> = self
            .bpf
            .map("PASSED")
            .context("PASSED map not found")?
            .try_into()
            .context("PASSED map type mismatch")?;
        let per_cpu = counters.get(&0, 0).context("reading PASSED counters")?;
        Ok(per_cpu.iter().sum())
    }

    /// Detach from every interface. The links go away with the `Ebpf` object.
    pub fn detach(self) {
        let passed = self.passed_frames().unwrap_or_else(|e| {
            warn!(error = %e, "could not read XDP frame counters");
            0
        });
        for iface in &self.attached {
            info!(interface = %iface, passed, "detaching XDP program");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_garbage() {
        assert!(XdpProgram::load(b"definitely not an ELF object").is_err());
    }

    #[test]
    fn test_load_rejects_empty() {
        assert!(XdpProgram::load(&[]).is_err());
    }
}

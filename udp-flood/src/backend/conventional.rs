//! Raw IPv4 socket transmit path.
//!
//! Sends the finished template (IP header included) with `sendto` in a tight
//! loop. The kernel fills the source address when the template leaves it 0.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use super::{Pacer, SendStats};
use crate::orchestrator::ExecutionContext;

/// Send socket buffer size (4 MB). Large enough to absorb send bursts.
const SEND_BUF_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ConventionalBackend {
    rate: Option<u64>,
}

impl ConventionalBackend {
    pub fn new(rate: Option<u64>) -> Self {
        Self { rate }
    }

    pub fn run(&self, ctx: &ExecutionContext, duration: Duration) -> Result<SendStats> {
        let socket = open_socket(&ctx.interface)
            .with_context(|| format!("opening raw socket on {}", ctx.interface))?;

        let dest: SockAddr = SocketAddr::V4(ctx.template.destination()).into();
        let bytes = ctx.template.as_bytes();
        let pacer = Pacer::new(self.rate);

        info!(
            unit = ctx.id,
            interface = %ctx.interface,
            target = %ctx.target,
            len = bytes.len(),
            "entering raw-socket send loop"
        );

        let mut stats = SendStats::default();
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                stats.elapsed = elapsed;
                break;
            }
            if pacer.budget(elapsed, stats.sent + stats.errors) == 0 {
                std::hint::spin_loop();
                continue;
            }
            match socket.send_to(bytes, &dest) {
                Ok(_) => stats.sent += 1,
                Err(_) => stats.errors += 1,
            }
        }

        debug!(unit = ctx.id, sent = stats.sent, errors = stats.errors, "raw-socket send loop exited");
        Ok(stats)
    }
}

/// Raw IPPROTO_RAW socket with IP_HDRINCL, bound to `iface`.
fn open_socket(iface: &str) -> Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(Protocol::from(libc::IPPROTO_RAW)),
    )
    .context("creating raw socket (CAP_NET_RAW required)")?;

    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error()).context("IP_HDRINCL");
    }

    socket
        .bind_device(Some(iface.as_bytes()))
        .with_context(|| format!("SO_BINDTODEVICE {}", iface))?;

    // Full buffer means EAGAIN, which the loop counts and moves past.
    socket.set_nonblocking(true)?;

    if let Err(e) = socket.set_send_buffer_size(SEND_BUF_SIZE) {
        warn!(error = %e, "failed to set SO_SNDBUF (continuing with default)");
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::Config;
    use crate::packet::PacketTemplate;
    use std::net::Ipv4Addr;

    fn loopback_context(rate: Option<u64>) -> ExecutionContext {
        let config = Config {
            port: 9999,
            payload_size: 64,
            ..Config::default()
        };
        let template =
            PacketTemplate::build(&config, Ipv4Addr::LOCALHOST, "127.0.0.1").unwrap();
        ExecutionContext {
            id: 0,
            core: 0,
            interface: "lo".to_string(),
            target: Ipv4Addr::LOCALHOST,
            template,
            backend: Backend::Conventional(ConventionalBackend::new(rate)),
        }
    }

    /// Without CAP_NET_RAW setup fails cleanly; with it, the loop runs for
    /// the full duration and reports what it sent.
    #[test]
    fn test_send_loop_honours_duration() {
        let ctx = loopback_context(None);
        let duration = Duration::from_millis(200);
        let started = Instant::now();

        match ctx.backend.run(&ctx, duration) {
            Ok(stats) => {
                assert!(stats.elapsed >= duration);
                assert!(started.elapsed() < duration + Duration::from_millis(500));
                assert!(stats.sent + stats.errors > 0);
            }
            Err(e) => {
                assert!(format!("{:#}", e).contains("raw socket"));
                assert!(started.elapsed() < duration);
            }
        }
    }

    #[test]
    fn test_rate_cap_bounds_sent_count() {
        let ctx = loopback_context(Some(100));
        if let Ok(stats) = ctx.backend.run(&ctx, Duration::from_millis(300)) {
            // 1 + 100 pps * ~0.3 s, with slack for the final iteration.
            assert!(stats.sent + stats.errors <= 40, "sent {}", stats.sent);
        }
    }
}

//! AF_XDP transmit path.
//!
//! Every arena frame is written once with the Ethernet-framed template. The
//! send loop then only publishes descriptors: frame `counter % frame_count`
//! for each slot it manages to reserve.
//!
//! Frames are recycled without waiting for their completion. That is sound
//! here because frame contents never change after the initial copy: a frame
//! still in flight and a frame being resubmitted hold the same bytes. The
//! completion ring is still drained every iteration, otherwise the kernel
//! stalls once it has no room to post completions.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::{Pacer, SendStats};
use crate::netif;
use crate::orchestrator::ExecutionContext;
use crate::packet::{MacAddr, PacketTemplate};
use crate::xsk::{Arena, BindMode, TxRing, XdpDesc, XskSocket};

/// Descriptors published per loop iteration.
pub const BATCH_SIZE: u32 = 64;

#[derive(Debug, Clone)]
pub struct ZeroCopyBackend {
    pub frame_count: u32,
    pub frame_size: u32,
    pub dst_mac: MacAddr,
    /// NIC queue this unit's socket binds to. Unique per interface.
    pub queue_id: u32,
    pub rate: Option<u64>,
    /// Set when the XDP program could not be attached to this interface.
    pub attach_error: Option<String>,
}

impl ZeroCopyBackend {
    pub fn run(&self, ctx: &ExecutionContext, duration: Duration) -> Result<SendStats> {
        if let Some(err) = &self.attach_error {
            bail!("XDP program is not attached to {}: {}", ctx.interface, err);
        }

        let ifindex = netif::interface_index(&ctx.interface)?;
        let src_mac = netif::interface_mac(&ctx.interface)?;

        // Declared before the socket so it is unmapped after the socket closes.
        let mut arena =
            Arena::new(self.frame_count, self.frame_size).context("allocating packet arena")?;
        let frame_len = populate_arena(&mut arena, &ctx.template, src_mac, self.dst_mac);

        let mut xsk = XskSocket::create(&arena, ifindex, self.queue_id)
            .with_context(|| format!("creating AF_XDP socket on {} queue {}", ctx.interface, self.queue_id))?;
        let always_wake = xsk.bind_mode() != BindMode::ZeroCopy;

        info!(
            unit = ctx.id,
            interface = %ctx.interface,
            target = %ctx.target,
            queue_id = self.queue_id,
            frames = self.frame_count,
            frame_len,
            %src_mac,
            dst_mac = %self.dst_mac,
            "entering AF_XDP send loop"
        );

        let pacer = Pacer::new(self.rate);
        let mut counter: u64 = 0;
        let start = Instant::now();

        // Initial fill: hand the kernel every frame once.
        let initial = pacer.budget(Duration::ZERO, 0).min(xsk.tx.capacity() as u64) as u32;
        submit_batch(&mut xsk.tx, &arena, frame_len, &mut counter, initial);
        xsk.wake();

        let elapsed = loop {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break elapsed;
            }

            xsk.completion.drain();

            let want = pacer.budget(elapsed, counter).min(BATCH_SIZE as u64) as u32;
            if want == 0 {
                std::hint::spin_loop();
                continue;
            }

            // A short or empty reservation is back-pressure; retry next time round.
            let submitted = submit_batch(&mut xsk.tx, &arena, frame_len, &mut counter, want);
            if submitted > 0 && (always_wake || xsk.tx.needs_wakeup()) {
                xsk.wake();
            }
        };

        debug!(unit = ctx.id, sent = counter, "AF_XDP send loop exited");
        Ok(SendStats {
            sent: counter,
            errors: 0,
            elapsed,
        })
    }
}

/// Frame used for the `counter`-th submission. Always `< frame_count`.
#[inline(always)]
pub fn frame_index(counter: u64, frame_count: u32) -> u32 {
    (counter % frame_count as u64) as u32
}

/// Copy the Ethernet-framed template into every frame. Returns the frame length.
fn populate_arena(
    arena: &mut Arena,
    template: &PacketTemplate,
    src_mac: MacAddr,
    dst_mac: MacAddr,
) -> u32 {
    let mut len = 0;
    for idx in 0..arena.frame_count() {
        len = template.write_ethernet_frame(arena.frame_mut(idx), src_mac, dst_mac);
    }
    len as u32
}

/// Reserve up to `want` TX slots, point each at the next frame in sequence,
/// and publish them. Returns how many were published and advances `counter`
/// by the same amount.
fn submit_batch(tx: &mut TxRing, arena: &Arena, frame_len: u32, counter: &mut u64, want: u32) -> u32 {
    let reserved = tx.reserve(want);
    if reserved == 0 {
        return 0;
    }
    for i in 0..reserved {
        let idx = frame_index(*counter + i as u64, arena.frame_count());
        tx.write(
            i,
            XdpDesc {
                addr: arena.frame_addr(idx),
                len: frame_len,
                options: 0,
            },
        );
    }
    tx.submit(reserved);
    *counter += reserved as u64;
    reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::packet::ETH_HEADER_LEN;
    use crate::xsk::tests::FakeRing;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    const FRAMES: u32 = 64;
    const FRAME_SIZE: u32 = 2048;

    #[test]
    fn test_frame_index_wraps() {
        assert_eq!(frame_index(0, 64), 0);
        assert_eq!(frame_index(63, 64), 63);
        assert_eq!(frame_index(64, 64), 0);
        assert_eq!(frame_index(u64::MAX, 64), 63);
    }

    #[test]
    fn test_populate_arena() {
        let config = Config {
            port: 7000,
            payload_size: 100,
            ..Config::default()
        };
        let template = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "192.0.2.9").unwrap();
        let mut arena = Arena::new(FRAMES, FRAME_SIZE).unwrap();
        let src = MacAddr([2, 0, 0, 0, 0, 1]);

        let len = populate_arena(&mut arena, &template, src, MacAddr::BROADCAST);
        assert_eq!(len as usize, ETH_HEADER_LEN + template.len());
        for idx in [0, 1, FRAMES / 2, FRAMES - 1] {
            let frame = arena.frame(idx);
            assert_eq!(&frame[..6], &[0xff; 6]);
            assert_eq!(&frame[ETH_HEADER_LEN..len as usize], template.as_bytes());
        }
    }

    #[test]
    fn test_initial_fill_then_back_pressure() {
        let arena = Arena::new(FRAMES, FRAME_SIZE).unwrap();
        let mut fake = FakeRing::new(FRAMES, std::mem::size_of::<XdpDesc>());
        let mut tx = TxRing::new(fake.ring(FRAMES));
        let mut counter = 0;

        assert_eq!(submit_batch(&mut tx, &arena, 60, &mut counter, FRAMES), FRAMES);
        assert_eq!(counter, FRAMES as u64);
        for i in 0..FRAMES {
            assert_eq!(fake.desc(i).addr, i as u64 * FRAME_SIZE as u64);
            assert_eq!(fake.desc(i).len, 60);
        }

        // Ring full: nothing reserved, counter unchanged.
        assert_eq!(submit_batch(&mut tx, &arena, 60, &mut counter, BATCH_SIZE), 0);
        assert_eq!(counter, FRAMES as u64);

        // Kernel consumed 10: a partial batch goes out and reuses frames 0..10.
        fake.set_consumer(10);
        assert_eq!(submit_batch(&mut tx, &arena, 60, &mut counter, BATCH_SIZE), 10);
        assert_eq!(counter, FRAMES as u64 + 10);
        for i in 0..10 {
            assert_eq!(fake.desc(i).addr, i as u64 * FRAME_SIZE as u64);
        }
        assert_eq!(fake.producer(), FRAMES + 10);
    }

    proptest! {
        /// However the kernel drains the ring, every descriptor we publish
        /// points inside the arena at a frame boundary.
        #[test]
        fn test_descriptors_stay_in_arena(drains in proptest::collection::vec(0u32..=FRAMES, 1..50)) {
            let arena = Arena::new(FRAMES, FRAME_SIZE).unwrap();
            let mut fake = FakeRing::new(FRAMES, std::mem::size_of::<XdpDesc>());
            let mut tx = TxRing::new(fake.ring(FRAMES));
            let mut counter = 0u64;
            let mut consumed = 0u32;

            submit_batch(&mut tx, &arena, 60, &mut counter, FRAMES);
            for drain in drains {
                let outstanding = (counter as u32).wrapping_sub(consumed);
                consumed = consumed.wrapping_add(drain.min(outstanding));
                fake.set_consumer(consumed);

                let before = counter;
                let n = submit_batch(&mut tx, &arena, 60, &mut counter, BATCH_SIZE);
                prop_assert_eq!(counter, before + n as u64);
                prop_assert!((counter as u32).wrapping_sub(consumed) <= FRAMES);

                for k in 0..n {
                    let slot = ((before + k as u64) % FRAMES as u64) as u32;
                    let desc = fake.desc(slot);
                    prop_assert!(desc.addr < FRAMES as u64 * FRAME_SIZE as u64);
                    prop_assert_eq!(desc.addr % FRAME_SIZE as u64, 0);
                    prop_assert_eq!(desc.addr / FRAME_SIZE as u64, frame_index(before + k as u64, FRAMES) as u64);
                }
            }
        }

        #[test]
        fn test_frame_index_in_range(counter in any::<u64>(), shift in 6u32..=20) {
            let frame_count = 1u32 << shift;
            prop_assert!(frame_index(counter, frame_count) < frame_count);
        }
    }
}

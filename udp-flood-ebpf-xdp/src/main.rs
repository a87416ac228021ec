//! XDP program loaded on transmit interfaces in AF_XDP mode.
//!
//! The flood engine never receives on its AF_XDP sockets, so every frame
//! goes up to the kernel stack untouched (ARP, ICMP and replies included).
//! Passed frames are counted per CPU for the end-of-run log.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::PerCpuArray,
    programs::XdpContext,
};

/// Slot 0: frames seen by this program on the current CPU.
#[map]
static PASSED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

#[xdp]
pub fn udp_flood_xdp(_ctx: XdpContext) -> u32 {
    if let Some(count) = PASSED.get_ptr_mut(0) {
        unsafe { *count += 1 };
    }
    xdp_action::XDP_PASS
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

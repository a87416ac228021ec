//! AF_XDP transmit plumbing: the packet arena (UMEM), the mmap'd TX and
//! completion rings, and the socket that ties them to an interface queue.
//!
//! Only the transmit half of AF_XDP is set up. The fill ring is sized because
//! the kernel refuses to bind a UMEM without one, but it is never mapped.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Linux AF_XDP Constants (from <linux/if_xdp.h>)
// ---------------------------------------------------------------------------

const SOL_XDP: i32 = 283;
const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_TX_RING: i32 = 3;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;

const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

// Bind flags
const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

// Ring flags
const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// AF_XDP Kernel Structs (repr(C) for FFI)
// ---------------------------------------------------------------------------

/// `struct xdp_umem_reg`. Every byte is a named field: the trailing word is
/// read by the kernel as the TX metadata length since 6.8.
#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct XdpRingOffset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset, // fill ring
    cr: XdpRingOffset, // completion ring
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// Whether this kernel lets the process open AF_XDP sockets at all.
pub fn supported() -> bool {
    let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        debug!(error = %io::Error::last_os_error(), "AF_XDP socket probe failed");
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

// ---------------------------------------------------------------------------
// Packet Arena (UMEM)
// ---------------------------------------------------------------------------

/// Page-aligned anonymous mapping split into `frame_count` frames of
/// `frame_size` bytes. Owned by exactly one backend instance.
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
    frame_size: u32,
    frame_count: u32,
}

// The arena is only ever touched by the unit that owns it.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(frame_count: u32, frame_size: u32) -> Result<Self> {
        if frame_count == 0 || frame_size == 0 {
            bail!("arena needs at least one non-empty frame");
        }
        let len = (frame_count as usize)
            .checked_mul(frame_size as usize)
            .context("arena size overflows")?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!("mmap arena ({} bytes): {}", len, io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).context("mmap returned null")?;

        debug!(len, frame_size, frame_count, "allocated packet arena");
        Ok(Self {
            ptr,
            len,
            frame_size,
            frame_count,
        })
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Arena-relative offset of frame `idx`, as carried in ring descriptors.
    pub fn frame_addr(&self, idx: u32) -> u64 {
        debug_assert!(idx < self.frame_count);
        idx as u64 * self.frame_size as u64
    }

    pub fn frame_mut(&mut self, idx: u32) -> &mut [u8] {
        assert!(idx < self.frame_count, "frame {} out of range", idx);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.frame_addr(idx) as usize),
                self.frame_size as usize,
            )
        }
    }

    #[cfg(test)]
    pub fn frame(&self, idx: u32) -> &[u8] {
        assert!(idx < self.frame_count, "frame {} out of range", idx);
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(self.frame_addr(idx) as usize),
                self.frame_size as usize,
            )
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// Ring Buffer Abstraction
// ---------------------------------------------------------------------------

/// A single-producer/single-consumer ring shared with the kernel.
pub(crate) struct RingBuffer {
    /// Pointer to producer index (u32, atomic).
    producer: *mut u32,
    /// Pointer to consumer index (u32, atomic).
    consumer: *mut u32,
    /// Pointer to flags (u32).
    flags: *mut u32,
    /// Pointer to the descriptor array.
    ring: *mut u8,
    /// Mask for wrapping indices (ring_size - 1).
    mask: u32,
    size: u32,
    /// Our side's producer index (producer rings) or last seen producer.
    cached_prod: u32,
    /// Our side's consumer index (consumer rings) or last seen consumer.
    cached_cons: u32,
    /// mmap base and size; `None` when the memory is not ours to unmap.
    mapping: Option<(*mut u8, usize)>,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Wrap ring memory at `base` laid out as described by `off`.
    ///
    /// # Safety
    /// `base` must stay valid for the lifetime of the ring and the offsets
    /// must point at `size` descriptors plus the index words.
    pub(crate) unsafe fn from_raw(
        base: *mut u8,
        off: &XdpRingOffset,
        size: u32,
        mapping: Option<(*mut u8, usize)>,
    ) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut ring = Self {
            producer: base.add(off.producer as usize) as *mut u32,
            consumer: base.add(off.consumer as usize) as *mut u32,
            flags: base.add(off.flags as usize) as *mut u32,
            ring: base.add(off.desc as usize),
            mask: size - 1,
            size,
            cached_prod: 0,
            cached_cons: 0,
            mapping,
        };
        ring.cached_prod = ring.load_producer();
        ring.cached_cons = ring.load_consumer();
        ring
    }

    #[inline(always)]
    fn load_producer(&self) -> u32 {
        let val = unsafe { core::ptr::read_volatile(self.producer) };
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        val
    }

    #[inline(always)]
    fn load_consumer(&self) -> u32 {
        let val = unsafe { core::ptr::read_volatile(self.consumer) };
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        val
    }

    #[inline(always)]
    fn store_producer(&self, val: u32) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        unsafe { core::ptr::write_volatile(self.producer, val) };
    }

    #[inline(always)]
    fn store_consumer(&self, val: u32) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        unsafe { core::ptr::write_volatile(self.consumer, val) };
    }

    #[inline(always)]
    fn load_flags(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.flags) }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Some((ptr, len)) = self.mapping {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, len);
            }
        }
    }
}

/// Producer side of the TX ring: we publish descriptors, the kernel sends them.
pub(crate) struct TxRing(RingBuffer);

impl TxRing {
    pub(crate) fn new(ring: RingBuffer) -> Self {
        Self(ring)
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.0.size
    }

    /// Claim up to `want` free slots. Returns how many were claimed, which is
    /// less than `want` when the kernel has not caught up yet.
    #[inline]
    pub(crate) fn reserve(&mut self, want: u32) -> u32 {
        let ring = &mut self.0;
        let free = ring.size - ring.cached_prod.wrapping_sub(ring.cached_cons);
        if free >= want {
            return want;
        }
        ring.cached_cons = ring.load_consumer();
        let free = ring.size - ring.cached_prod.wrapping_sub(ring.cached_cons);
        free.min(want)
    }

    /// Write descriptor `i` of the current reservation.
    #[inline]
    pub(crate) fn write(&mut self, i: u32, desc: XdpDesc) {
        let ring = &mut self.0;
        let idx = (ring.cached_prod.wrapping_add(i) & ring.mask) as usize;
        unsafe {
            let slot = ring.ring.add(idx * std::mem::size_of::<XdpDesc>()) as *mut XdpDesc;
            core::ptr::write_volatile(slot, desc);
        }
    }

    /// Publish the first `n` written descriptors to the kernel.
    #[inline]
    pub(crate) fn submit(&mut self, n: u32) {
        let ring = &mut self.0;
        ring.cached_prod = ring.cached_prod.wrapping_add(n);
        ring.store_producer(ring.cached_prod);
    }

    #[inline]
    pub(crate) fn needs_wakeup(&self) -> bool {
        self.0.load_flags() & XDP_RING_NEED_WAKEUP != 0
    }
}

/// Consumer side of the completion ring: frame addresses the kernel is done with.
pub(crate) struct CompletionRing(RingBuffer);

impl CompletionRing {
    pub(crate) fn new(ring: RingBuffer) -> Self {
        Self(ring)
    }

    /// Release every completion the kernel has posted. Returns how many.
    #[inline]
    pub(crate) fn drain(&mut self) -> u32 {
        let ring = &mut self.0;
        let prod = ring.load_producer();
        let ready = prod.wrapping_sub(ring.cached_cons);
        if ready > 0 {
            ring.cached_cons = prod;
            ring.store_consumer(prod);
        }
        ready
    }
}

// ---------------------------------------------------------------------------
// AF_XDP Socket
// ---------------------------------------------------------------------------

/// How the socket ended up bound to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ZeroCopy,
    Copy,
    Default,
}

impl BindMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BindMode::ZeroCopy => "zero-copy",
            BindMode::Copy => "copy",
            BindMode::Default => "default",
        }
    }
}

/// A bound, transmit-only AF_XDP socket over an [`Arena`].
///
/// Fields drop in order: rings are unmapped before the socket is closed.
pub struct XskSocket {
    pub(crate) tx: TxRing,
    pub(crate) completion: CompletionRing,
    fd: OwnedFd,
    bind_mode: BindMode,
}

impl XskSocket {
    /// Register `arena` with a new AF_XDP socket and bind it to
    /// `ifindex`/`queue_id`. Ring capacities equal the arena's frame count.
    pub fn create(arena: &Arena, ifindex: u32, queue_id: u32) -> Result<Self> {
        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            bail!("creating AF_XDP socket: {}", io::Error::last_os_error());
        }
        // From here on the fd is closed on every early return.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // --- Register UMEM ---
        let umem_reg = XdpUmemReg {
            addr: arena.as_ptr() as u64,
            len: arena.len() as u64,
            chunk_size: arena.frame_size(),
            headroom: 0,
            flags: 0,
            tx_metadata_len: 0,
        };
        setsockopt(fd.as_raw_fd(), SOL_XDP, XDP_UMEM_REG, &umem_reg).context("XDP_UMEM_REG")?;

        // --- Set ring sizes ---
        let ring_size = arena.frame_count();
        for (opt, name) in [
            (XDP_UMEM_FILL_RING, "FILL"),
            (XDP_UMEM_COMPLETION_RING, "COMPLETION"),
            (XDP_TX_RING, "TX"),
        ] {
            setsockopt(fd.as_raw_fd(), SOL_XDP, opt, &ring_size)
                .with_context(|| format!("setting {} ring size", name))?;
        }

        // --- Get mmap offsets ---
        let mut offsets = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            bail!("XDP_MMAP_OFFSETS: {}", io::Error::last_os_error());
        }
        debug!(?offsets, "got XDP mmap offsets");

        // --- mmap TX and completion rings ---
        let tx_len =
            offsets.tx.desc as usize + ring_size as usize * std::mem::size_of::<XdpDesc>();
        let tx_base = map_ring(fd.as_raw_fd(), tx_len, XDP_PGOFF_TX_RING).context("mmap TX ring")?;
        let tx = TxRing::new(unsafe {
            RingBuffer::from_raw(tx_base, &offsets.tx, ring_size, Some((tx_base, tx_len)))
        });

        let cr_len = offsets.cr.desc as usize + ring_size as usize * std::mem::size_of::<u64>();
        let cr_base = map_ring(fd.as_raw_fd(), cr_len, XDP_UMEM_PGOFF_COMPLETION_RING)
            .context("mmap completion ring")?;
        let completion = CompletionRing::new(unsafe {
            RingBuffer::from_raw(cr_base, &offsets.cr, ring_size, Some((cr_base, cr_len)))
        });

        // --- Bind to interface + queue ---
        let bind_mode = bind_socket(fd.as_raw_fd(), ifindex, queue_id)?;

        info!(
            ifindex,
            queue_id,
            ring_size,
            mode = bind_mode.as_str(),
            "AF_XDP socket bound"
        );

        Ok(Self {
            tx,
            completion,
            fd,
            bind_mode,
        })
    }

    pub fn bind_mode(&self) -> BindMode {
        self.bind_mode
    }

    /// Kick the kernel to drain the TX ring. Never blocks; EAGAIN, EBUSY and
    /// ENOBUFS only mean the kernel is still busy with earlier frames.
    #[inline]
    pub fn wake(&self) {
        unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            );
        }
    }
}

/// Try zero-copy, then copy mode, then whatever the driver offers.
fn bind_socket(fd: RawFd, ifindex: u32, queue_id: u32) -> Result<BindMode> {
    let mut errors = Vec::with_capacity(3);
    for (flags, mode) in [
        (XDP_ZEROCOPY, BindMode::ZeroCopy),
        (XDP_COPY, BindMode::Copy),
        (0, BindMode::Default),
    ] {
        let sxdp = SockaddrXdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: flags | XDP_USE_NEED_WAKEUP,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(mode);
        }
        let err = io::Error::last_os_error();
        warn!(mode = mode.as_str(), error = %err, "AF_XDP bind attempt failed");
        errors.push(format!("{}: {}", mode.as_str(), err));
    }

    bail!(
        "bind AF_XDP socket to ifindex={} queue={}: {}",
        ifindex,
        queue_id,
        errors.join(", ")
    )
}

fn map_ring(fd: RawFd, len: usize, pgoff: libc::off_t) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            pgoff,
        )
    };
    if ptr == libc::MAP_FAILED {
        bail!("{}", io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

fn setsockopt<T>(fd: RawFd, level: i32, name: i32, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

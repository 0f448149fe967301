//! AF_PACKET ring geometry and kernel ABI.
//!
//! The kernel shares the RX ring as a sequence of fixed-size blocks; in
//! TPACKET_V3 each block holds a linked list of packets behind a block
//! descriptor, in V2/V1 every frame stands alone. All layouts are declared
//! here together with the byte offsets the engine reads packet metadata at,
//! so every access into the shared mapping goes through one bounds-checked
//! surface.

use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

// Ring sizing. Blocks are 16 KiB; the ring must hold at least one MiB and is
// capped by the address space of the host.
pub const BLOCK_SIZE: usize = 4096 << 2;
pub const MIN_RING_SIZE: usize = 1024 * 1024;
#[cfg(target_pointer_width = "64")]
pub const MAX_RING_SIZE: usize = 16 * 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_RING_SIZE: usize = 1024 * 1024 * 1024;
pub const DEFAULT_RING_SIZE: usize = 256 * 1024 * 1024;

// <linux/if_packet.h> values not exported by the libc crate.
pub(crate) const PACKET_RX_RING: libc::c_int = 5;
pub(crate) const PACKET_STATISTICS: libc::c_int = 6;
pub(crate) const PACKET_VERSION: libc::c_int = 10;

pub(crate) const TP_STATUS_KERNEL: u32 = 0;
pub(crate) const TP_STATUS_USER: u32 = 1;

const TPACKET_ALIGNMENT: usize = 16;
const ETH_DATA_LEN: usize = 1500;

/// Timeout before the kernel retires a partially-filled v3 block.
const RETIRE_BLOCK_TIMEOUT_MS: u32 = 100;

const fn tpacket_align(n: usize) -> usize {
    (n + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// sizeof() of the kernel header structs. tpacket_hdr opens with a C long
// status word and pads back up to long alignment, so its size follows the
// word size; the v2/v3 headers are fixed.
const TPACKET_HDR_SIZE: usize =
    align_up(size_of::<libc::c_ulong>() + 20, size_of::<libc::c_ulong>());
const TPACKET2_HDR_SIZE: usize = 32;
const TPACKET3_HDR_SIZE: usize = 48;

/// PACKET_RX_RING request, V1/V2 shape.
#[repr(C)]
pub(crate) struct TpacketReq {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
}

/// PACKET_RX_RING request, V3 shape.
#[repr(C)]
pub(crate) struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

impl TpacketReq3 {
    pub fn from_layout(layout: &RingLayout) -> Self {
        Self {
            tp_block_size: layout.block_size as u32,
            tp_block_nr: layout.nblocks as u32,
            tp_frame_size: layout.frame_size as u32,
            tp_frame_nr: layout.nframes as u32,
            tp_retire_blk_tov: RETIRE_BLOCK_TIMEOUT_MS,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        }
    }
}

impl TpacketReq {
    pub fn from_layout(layout: &RingLayout) -> Self {
        Self {
            tp_block_size: layout.block_size as u32,
            tp_block_nr: layout.nblocks as u32,
            tp_frame_size: layout.frame_size as u32,
            tp_frame_nr: layout.nframes as u32,
        }
    }
}

// Field offsets within a v3 block descriptor (tpacket_block_desc: version,
// offset_to_priv, then tpacket_hdr_v1) and within a v3 packet header.
pub(crate) mod v3 {
    pub const BLOCK_STATUS: usize = 8;
    pub const BLOCK_NUM_PKTS: usize = 12;
    pub const BLOCK_FIRST_PKT: usize = 16;

    pub const PKT_NEXT_OFFSET: usize = 0;
    pub const PKT_SEC: usize = 4;
    pub const PKT_NSEC: usize = 8;
    pub const PKT_SNAPLEN: usize = 12;
    pub const PKT_MAC: usize = 24;
}

// Field offsets within a v2 frame header.
pub(crate) mod v2 {
    pub const STATUS: usize = 0;
    pub const SNAPLEN: usize = 8;
    pub const MAC: usize = 12;
    pub const SEC: usize = 16;
    pub const NSEC: usize = 20;
}

// Field offsets within a legacy frame header. tp_status is a C long, so
// everything after it shifts with the word size.
pub(crate) mod v1 {
    use std::mem::size_of;

    pub const STATUS: usize = 0;
    pub const SNAPLEN: usize = size_of::<libc::c_ulong>() + 4;
    pub const MAC: usize = size_of::<libc::c_ulong>() + 8;
    pub const SEC: usize = size_of::<libc::c_ulong>() + 12;
    pub const USEC: usize = size_of::<libc::c_ulong>() + 16;
}

/// Ring protocol variant, picked at startup by probing PACKET_VERSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingVersion {
    /// TPACKET_V3: per-block ownership, packets chained inside the block.
    V3,
    /// TPACKET_V2: per-frame ownership, nanosecond timestamps.
    V2,
    /// Legacy TPACKET_V1: per-frame ownership, microsecond timestamps.
    V1,
}

impl RingVersion {
    /// PACKET_VERSION option value.
    pub(crate) fn sockopt_value(self) -> libc::c_int {
        match self {
            RingVersion::V1 => 0,
            RingVersion::V2 => 1,
            RingVersion::V3 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RingVersion::V3 => "tpacket-v3",
            RingVersion::V2 => "tpacket-v2",
            RingVersion::V1 => "tpacket-v1",
        }
    }

    /// Full per-packet header length: aligned tpacket header plus the
    /// sockaddr_ll the kernel stores behind it.
    fn header_len(self) -> usize {
        let hdr = match self {
            RingVersion::V3 => TPACKET3_HDR_SIZE,
            RingVersion::V2 => TPACKET2_HDR_SIZE,
            RingVersion::V1 => TPACKET_HDR_SIZE,
        };
        tpacket_align(hdr) + size_of::<libc::sockaddr_ll>()
    }
}

/// Ring geometry derived from the configured size and the ring version.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    pub block_size: usize,
    pub frame_size: usize,
    pub nblocks: usize,
    pub nframes: usize,
    /// Bytes actually mapped: `nblocks * block_size <= requested size`.
    pub ring_bytes: usize,
}

impl RingLayout {
    pub fn compute(ring_size: usize, version: RingVersion) -> Self {
        // Smallest power of two holding an aligned header plus an aligned
        // Ethernet MTU.
        let want = tpacket_align(version.header_len()) + tpacket_align(ETH_DATA_LEN);
        let mut frame_size = 8;
        while frame_size < want {
            frame_size *= 2;
        }

        let nblocks = ring_size / BLOCK_SIZE;
        let ring_bytes = nblocks * BLOCK_SIZE;
        let nframes = ring_bytes / frame_size;

        Self { block_size: BLOCK_SIZE, frame_size, nblocks, nframes, ring_bytes }
    }
}

/// The mmap'd ring shared with the kernel.
///
/// All reads and writes go through bounds-asserted accessors; status-field
/// accessors pair with acquire/release fences so packet data is only read
/// while the user side owns the block or frame.
pub(crate) struct RingMap {
    base: *mut u8,
    len: usize,
}

impl RingMap {
    pub fn map(fd: libc::c_int, len: usize) -> io::Result<Self> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base: base as *mut u8, len })
    }

    /// Private anonymous mapping standing in for a kernel ring in tests.
    #[cfg(test)]
    pub fn anonymous(len: usize) -> Self {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(base != libc::MAP_FAILED);
        Self { base: base as *mut u8, len }
    }

    fn check(&self, off: usize, n: usize) {
        assert!(
            off.checked_add(n).is_some_and(|end| end <= self.len),
            "ring access out of bounds: {off}+{n} > {}",
            self.len
        );
    }

    /// Borrow `len` bytes starting at `off`. Only call while the containing
    /// block/frame is user-owned, and drop the slice before releasing it.
    pub fn slice(&self, off: usize, len: usize) -> &[u8] {
        self.check(off, len);
        unsafe { std::slice::from_raw_parts(self.base.add(off), len) }
    }

    pub fn read_u16(&self, off: usize) -> u16 {
        self.check(off, 2);
        unsafe { ptr::read_volatile(self.base.add(off) as *const u16) }
    }

    pub fn read_u32(&self, off: usize) -> u32 {
        self.check(off, 4);
        unsafe { ptr::read_volatile(self.base.add(off) as *const u32) }
    }

    /// Read a status word and acquire everything the kernel published
    /// before setting it.
    pub fn read_status_u32(&self, off: usize) -> u32 {
        let status = self.read_u32(off);
        fence(Ordering::Acquire);
        status
    }

    pub fn read_status_ulong(&self, off: usize) -> libc::c_ulong {
        self.check(off, size_of::<libc::c_ulong>());
        let status = unsafe { ptr::read_volatile(self.base.add(off) as *const libc::c_ulong) };
        fence(Ordering::Acquire);
        status
    }

    /// Write a status word, releasing every prior read of the block/frame.
    pub fn write_status_u32(&self, off: usize, val: u32) {
        self.check(off, 4);
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.base.add(off) as *mut u32, val) }
    }

    pub fn write_status_ulong(&self, off: usize, val: libc::c_ulong) {
        self.check(off, size_of::<libc::c_ulong>());
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.base.add(off) as *mut libc::c_ulong, val) }
    }

    #[cfg(test)]
    pub fn fill(&self, off: usize, bytes: &[u8]) {
        self.check(off, bytes.len());
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), bytes.len()) }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_block_aligned_and_within_request() {
        for version in [RingVersion::V3, RingVersion::V2, RingVersion::V1] {
            for ring_size in [MIN_RING_SIZE, 3 * 1024 * 1024 + 12345, DEFAULT_RING_SIZE] {
                let layout = RingLayout::compute(ring_size, version);
                assert!(layout.ring_bytes <= ring_size);
                assert_eq!(layout.ring_bytes % layout.block_size, 0);
                assert_eq!(layout.ring_bytes, layout.nblocks * layout.block_size);
                assert!(layout.nframes * layout.frame_size <= layout.ring_bytes);
            }
        }
    }

    #[test]
    fn test_frame_size_is_power_of_two_and_fits_mtu() {
        for version in [RingVersion::V3, RingVersion::V2, RingVersion::V1] {
            let layout = RingLayout::compute(MIN_RING_SIZE, version);
            assert!(layout.frame_size.is_power_of_two());
            assert!(layout.frame_size >= version.header_len() + ETH_DATA_LEN);
            assert!(layout.frame_size <= layout.block_size);
        }
    }

    #[test]
    fn test_ringmap_roundtrips_status_and_bytes() {
        let map = RingMap::anonymous(BLOCK_SIZE);
        map.write_status_u32(8, TP_STATUS_USER);
        assert_eq!(map.read_status_u32(8), TP_STATUS_USER);
        map.write_status_u32(8, TP_STATUS_KERNEL);
        assert_eq!(map.read_status_u32(8), TP_STATUS_KERNEL);

        map.fill(100, b"frame bytes");
        assert_eq!(map.slice(100, 11), b"frame bytes");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_ringmap_rejects_out_of_bounds_access() {
        let map = RingMap::anonymous(BLOCK_SIZE);
        map.slice(BLOCK_SIZE - 4, 8);
    }
}

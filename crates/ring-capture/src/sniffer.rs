//! AF_PACKET ring-buffer capture engine.
//!
//! Owns the raw packet socket and the mmap'd RX ring, and runs the
//! acquire → classify → persist → release loop:
//!
//! * the kernel flips a block (v3) or frame (v1/v2) to user ownership,
//! * the engine walks every packet in it, runs the filter over IPv4
//!   payloads and hands accepted frames to the pcap writer,
//! * the slot is flipped back to kernel ownership and the cursor advances.
//!
//! Packet bytes are read in place from the shared mapping; nothing is
//! copied until a packet has been accepted. A single thread drives the loop
//! and blocks in `poll` while the ring is empty; shutdown is a cooperative
//! flag checked at every iteration boundary, so a signal only has to wake
//! `poll` (EINTR) to stop the capture.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::mem::{self, size_of};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use socket2::Socket;
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::filter::Filter;
use crate::pcap::PcapFile;
use crate::ring::{
    RingLayout, RingMap, RingVersion, TpacketReq, TpacketReq3, MAX_RING_SIZE, MIN_RING_SIZE,
    PACKET_RX_RING, PACKET_STATISTICS, PACKET_VERSION, TP_STATUS_KERNEL, TP_STATUS_USER,
};
use crate::ring::{v1, v2, v3};

const ETH_HLEN: usize = 14;
const MIN_IP_HDR: usize = 20;
const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];

// <linux/if_packet.h> packet types for sockaddr_ll.sll_pkttype.
const PACKET_HOST: u8 = 0;
const PACKET_OUTGOING: u8 = 4;

/// Immutable capture parameters, fixed before `run`.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub output_path: PathBuf,
    pub ring_size: usize,
    /// 0 streams records to disk as they arrive; otherwise the capture is
    /// accumulated in a buffer of exactly this size and flushed on shutdown.
    pub max_pcap_filesize: usize,
}

/// Counters reported when the capture finishes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Packets persisted to the capture file.
    pub packets_captured: u64,
    /// Non-IPv4 frames dropped because a filter was installed.
    pub non_ip_dropped: u64,
    /// Packets the kernel delivered to the socket (PACKET_STATISTICS).
    pub kernel_received: u32,
    /// Packets the kernel dropped for lack of ring space.
    pub kernel_dropped: u32,
    /// The preallocated buffer filled up and ended the capture early.
    pub buffer_overflow: bool,
}

pub struct Sniffer {
    socket: Socket,
    version: RingVersion,
    layout: RingLayout,
    ring: RingMap,
    /// Byte offset of each block (v3) or frame (v1/v2) in the mapping.
    slots: Vec<usize>,
    idx: usize,
    writer: PcapFile,
    preallocated: bool,
    output_path: PathBuf,
    filter: Filter,
    stats: CaptureStats,
}

impl Sniffer {
    /// Open the socket, set up the ring and the output sink, and bind to the
    /// interface. Any failing step aborts the whole setup.
    pub fn create(config: &CaptureConfig, filter: Filter) -> Result<Self> {
        if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&config.ring_size) {
            return Err(CaptureError::Config(format!(
                "ring size {} out of range ({MIN_RING_SIZE}..={MAX_RING_SIZE})",
                config.ring_size
            )));
        }
        if config.interface.len() >= libc::IFNAMSIZ {
            return Err(CaptureError::Config(format!(
                "interface name `{}` is too long",
                config.interface
            )));
        }
        if config.output_path.as_os_str().len() >= libc::PATH_MAX as usize {
            return Err(CaptureError::Config("output path is too long".into()));
        }

        let preallocated = config.max_pcap_filesize > 0;
        if preallocated {
            // Fail now if the output location is unwritable; the real file
            // only appears at flush time.
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&config.output_path)
                .map_err(|e| CaptureError::setup("open capture file", e))?;
            std::fs::remove_file(&config.output_path)?;
        }

        let socket = open_packet_socket()?;
        let fd = socket.as_raw_fd();

        let version = probe_ring_version(fd)?;
        debug!(version = version.name(), "ring protocol selected");

        let ifindex = interface_index(&config.interface)?;
        enable_promiscuous(fd, ifindex)?;

        let layout = RingLayout::compute(config.ring_size, version);
        debug!(
            nblocks = layout.nblocks,
            block_size = layout.block_size,
            nframes = layout.nframes,
            frame_size = layout.frame_size,
            ring_bytes = layout.ring_bytes,
            "ring layout"
        );

        match version {
            RingVersion::V3 => {
                setsockopt(fd, libc::SOL_PACKET, PACKET_RX_RING, &TpacketReq3::from_layout(&layout))
                    .map_err(|e| CaptureError::setup("request packet ring", e))?;
            }
            RingVersion::V2 | RingVersion::V1 => {
                setsockopt(fd, libc::SOL_PACKET, PACKET_RX_RING, &TpacketReq::from_layout(&layout))
                    .map_err(|e| CaptureError::setup("request packet ring", e))?;
            }
        }

        let ring = RingMap::map(fd, layout.ring_bytes)
            .map_err(|e| CaptureError::setup("map packet ring", e))?;

        let (nslots, stride) = match version {
            RingVersion::V3 => (layout.nblocks, layout.block_size),
            RingVersion::V2 | RingVersion::V1 => (layout.nframes, layout.frame_size),
        };
        let slots = (0..nslots).map(|i| i * stride).collect();

        let writer = if preallocated {
            PcapFile::in_memory(config.max_pcap_filesize)?
        } else {
            PcapFile::create(&config.output_path)?
        };

        bind_to_interface(fd, ifindex)?;

        info!(
            interface = %config.interface,
            version = version.name(),
            ring_mb = layout.ring_bytes / (1024 * 1024),
            preallocated,
            "capture ready"
        );

        Ok(Self {
            socket,
            version,
            layout,
            ring,
            slots,
            idx: 0,
            writer,
            preallocated,
            output_path: config.output_path.clone(),
            filter,
            stats: CaptureStats::default(),
        })
    }

    pub fn version(&self) -> RingVersion {
        self.version
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Run the capture loop until `running` is cleared or a fatal error
    /// occurs. A full preallocated buffer ends the loop but is not an error;
    /// the records gathered so far are flushed by [`finish`].
    ///
    /// [`finish`]: Sniffer::finish
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN | libc::POLLRDNORM | libc::POLLERR,
            revents: 0,
        };

        while running.load(Ordering::SeqCst) {
            if !self.slot_ready() {
                let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    // A signal woke us; the loop condition re-checks the flag.
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(CaptureError::Io(err));
                }
                continue;
            }

            match self.process_slot() {
                Ok(()) => {}
                Err(CaptureError::BufferFull) => {
                    warn!(
                        packets = self.stats.packets_captured,
                        "capture buffer full, stopping"
                    );
                    self.stats.buffer_overflow = true;
                    break;
                }
                Err(e) => return Err(e),
            }

            self.release_slot();
            self.idx = (self.idx + 1) % self.slots.len();
        }

        Ok(())
    }

    /// Flush/close the output and collect the kernel's socket statistics.
    pub fn finish(mut self) -> Result<CaptureStats> {
        if self.preallocated {
            self.writer.flush_to(&self.output_path)?;
            info!(
                bytes = self.writer.bytes_written(),
                path = %self.output_path.display(),
                "capture file written"
            );
        } else {
            self.writer.close()?;
        }

        self.fetch_kernel_stats();
        Ok(self.stats.clone())
    }

    /// Ownership check on the current slot's status field.
    fn slot_ready(&self) -> bool {
        let off = self.slots[self.idx];
        match self.version {
            RingVersion::V3 => {
                self.ring.read_status_u32(off + v3::BLOCK_STATUS) & TP_STATUS_USER != 0
            }
            RingVersion::V2 => self.ring.read_status_u32(off + v2::STATUS) & TP_STATUS_USER != 0,
            RingVersion::V1 => {
                self.ring.read_status_ulong(off + v1::STATUS) & TP_STATUS_USER as libc::c_ulong
                    != 0
            }
        }
    }

    /// Drain every packet in the current block/frame into the writer.
    fn process_slot(&mut self) -> Result<()> {
        let off = self.slots[self.idx];
        let filter = &self.filter;
        let writer = &mut self.writer;
        let stats = &mut self.stats;
        drain_slot(&self.ring, self.version, off, |eth, ts_sec, ts_usec| {
            handle_frame(filter, writer, stats, eth, ts_sec, ts_usec)
        })
    }

    /// Hand the current slot back to the kernel.
    fn release_slot(&self) {
        let off = self.slots[self.idx];
        match self.version {
            RingVersion::V3 => self.ring.write_status_u32(off + v3::BLOCK_STATUS, TP_STATUS_KERNEL),
            RingVersion::V2 => self.ring.write_status_u32(off + v2::STATUS, TP_STATUS_KERNEL),
            RingVersion::V1 => {
                self.ring.write_status_ulong(off + v1::STATUS, TP_STATUS_KERNEL as libc::c_ulong)
            }
        }
    }

    fn fetch_kernel_stats(&mut self) {
        // The v3 struct carries a third counter; v1/v2 only two.
        let mut counters = [0u32; 3];
        let mut optlen = match self.version {
            RingVersion::V3 => size_of::<[u32; 3]>(),
            RingVersion::V2 | RingVersion::V1 => size_of::<[u32; 2]>(),
        } as libc::socklen_t;

        let rc = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                counters.as_mut_ptr() as *mut libc::c_void,
                &mut optlen,
            )
        };
        if rc == 0 {
            self.stats.kernel_received = counters[0];
            self.stats.kernel_dropped = counters[1];
        } else {
            warn!(error = %io::Error::last_os_error(), "couldn't read packet statistics");
        }
    }
}

/// Raw link-layer socket receiving every Ethernet protocol.
fn open_packet_socket() -> Result<Socket> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
    if fd < 0 {
        return Err(CaptureError::last_os("create packet socket"));
    }
    Ok(unsafe { Socket::from_raw_fd(fd) })
}

/// Newest ring protocol the running kernel accepts: v3, then v2, then the
/// legacy layout (kernels predating PACKET_VERSION reject the option with
/// EINVAL but still serve v1 rings).
fn probe_ring_version(fd: libc::c_int) -> Result<RingVersion> {
    for version in [RingVersion::V3, RingVersion::V2] {
        match setsockopt(fd, libc::SOL_PACKET, PACKET_VERSION, &version.sockopt_value()) {
            Ok(()) => return Ok(version),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => continue,
            Err(e) => return Err(CaptureError::setup("set packet version", e)),
        }
    }
    Ok(RingVersion::V1)
}

fn interface_index(interface: &str) -> Result<libc::c_uint> {
    let name = CString::new(interface)
        .map_err(|_| CaptureError::Config(format!("bad interface name `{interface}`")))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(CaptureError::last_os("resolve interface"));
    }
    Ok(index)
}

fn enable_promiscuous(fd: libc::c_int, ifindex: libc::c_uint) -> Result<()> {
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex as libc::c_int;
    mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
    setsockopt(fd, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq)
        .map_err(|e| CaptureError::setup("enable promiscuous mode", e))
}

/// Bind to the interface, accepting both incoming and outgoing packets.
fn bind_to_interface(fd: libc::c_int, ifindex: libc::c_uint) -> Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = ifindex as libc::c_int;
    addr.sll_pkttype = PACKET_HOST | PACKET_OUTGOING;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(CaptureError::last_os("bind packet socket"));
    }
    Ok(())
}

fn setsockopt<T>(
    fd: libc::c_int,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Walk every packet in the block (v3) or the single packet in the frame
/// (v1/v2) and feed `(ethernet frame, ts_sec, ts_usec)` to `sink`.
///
/// v2/v3 rings timestamp in nanoseconds; pcap records want microseconds.
fn drain_slot(
    ring: &RingMap,
    version: RingVersion,
    slot_off: usize,
    mut sink: impl FnMut(&[u8], u32, u32) -> Result<()>,
) -> Result<()> {
    match version {
        RingVersion::V3 => {
            let num_pkts = ring.read_u32(slot_off + v3::BLOCK_NUM_PKTS) as usize;
            let mut pkt = slot_off + ring.read_u32(slot_off + v3::BLOCK_FIRST_PKT) as usize;
            for _ in 0..num_pkts {
                let mac = ring.read_u16(pkt + v3::PKT_MAC) as usize;
                let snaplen = ring.read_u32(pkt + v3::PKT_SNAPLEN) as usize;
                let sec = ring.read_u32(pkt + v3::PKT_SEC);
                let usec = ring.read_u32(pkt + v3::PKT_NSEC) / 1000;
                sink(ring.slice(pkt + mac, snaplen), sec, usec)?;
                pkt += ring.read_u32(pkt + v3::PKT_NEXT_OFFSET) as usize;
            }
            Ok(())
        }
        RingVersion::V2 => {
            let mac = ring.read_u16(slot_off + v2::MAC) as usize;
            let snaplen = ring.read_u32(slot_off + v2::SNAPLEN) as usize;
            let sec = ring.read_u32(slot_off + v2::SEC);
            let usec = ring.read_u32(slot_off + v2::NSEC) / 1000;
            sink(ring.slice(slot_off + mac, snaplen), sec, usec)
        }
        RingVersion::V1 => {
            let mac = ring.read_u16(slot_off + v1::MAC) as usize;
            let snaplen = ring.read_u32(slot_off + v1::SNAPLEN) as usize;
            let sec = ring.read_u32(slot_off + v1::SEC);
            let usec = ring.read_u32(slot_off + v1::USEC);
            sink(ring.slice(slot_off + mac, snaplen), sec, usec)
        }
    }
}

/// Classify one captured Ethernet frame and persist it if accepted.
///
/// IPv4 frames go through the filter after header sanity checks (frames too
/// short for their own headers are skipped). Anything else is persisted raw
/// when no filter is installed and dropped (counted) otherwise. The whole
/// Ethernet frame is written, not just the IP payload.
fn handle_frame(
    filter: &Filter,
    writer: &mut PcapFile,
    stats: &mut CaptureStats,
    eth: &[u8],
    ts_sec: u32,
    ts_usec: u32,
) -> Result<()> {
    let is_ipv4 = eth.len() >= ETH_HLEN && eth[12..14] == ETHERTYPE_IPV4;

    if is_ipv4 {
        if eth.len() < ETH_HLEN + MIN_IP_HDR {
            return Ok(());
        }
        let ip = &eth[ETH_HLEN..];
        let ip_header_len = usize::from(ip[0] & 0x0f) * 4;
        if ip.len() < ip_header_len {
            return Ok(());
        }
        if !filter.matches(ip, ip_header_len) {
            return Ok(());
        }
    } else if filter.is_enabled() {
        stats.non_ip_dropped += 1;
        return Ok(());
    }

    writer.write_packet(ts_sec, ts_usec, eth)?;
    stats.packets_captured += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::{GLOBAL_HEADER_LEN, RECORD_HEADER_LEN};
    use crate::ring::BLOCK_SIZE;
    use pcap_file::pcap::PcapReader;
    use std::fs;

    // ─── frame builders ──────────────────────────────────────────────────

    fn eth_frame(ethertype: [u8; 2], payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HLEN + payload.len());
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // dst MAC
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // src MAC
        frame.extend_from_slice(&ethertype);
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4_packet(protocol: u8, transport: &[u8]) -> Vec<u8> {
        let total = 20 + transport.len();
        let mut ip = vec![0u8; total];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = protocol;
        ip[20..].copy_from_slice(transport);
        ip
    }

    fn tcp_frame(sport: u16, dport: u16) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        tcp[12] = 5 << 4;
        eth_frame(ETHERTYPE_IPV4, &ipv4_packet(0x06, &tcp))
    }

    fn udp_frame(sport: u16, dport: u16) -> Vec<u8> {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        eth_frame(ETHERTYPE_IPV4, &ipv4_packet(0x11, &udp))
    }

    fn icmp_frame() -> Vec<u8> {
        eth_frame(ETHERTYPE_IPV4, &ipv4_packet(0x01, &[8, 0, 0, 0]))
    }

    fn arp_frame() -> Vec<u8> {
        eth_frame([0x08, 0x06], &[0u8; 28])
    }

    fn capture(filter: &Filter, writer: &mut PcapFile, frames: &[Vec<u8>]) -> CaptureStats {
        let mut stats = CaptureStats::default();
        for (i, frame) in frames.iter().enumerate() {
            match handle_frame(filter, writer, &mut stats, frame, 1000 + i as u32, i as u32) {
                Ok(()) | Err(CaptureError::BufferFull) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        stats
    }

    fn read_back(path: &std::path::Path) -> Vec<Vec<u8>> {
        let mut reader = PcapReader::new(fs::File::open(path).unwrap()).unwrap();
        let mut frames = Vec::new();
        while let Some(pkt) = reader.next_packet() {
            frames.push(pkt.unwrap().data.into_owned());
        }
        frames
    }

    // ─── end-to-end scenarios over the per-packet path ────────────────────

    #[test]
    fn test_accept_all_persists_everything_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all.pcap");

        let frames = vec![tcp_frame(80, 40000), udp_frame(53, 40000), arp_frame()];
        let mut writer = PcapFile::create(&path).unwrap();
        let stats = capture(&Filter::new(), &mut writer, &frames);
        writer.close().unwrap();

        assert_eq!(stats.packets_captured, 3);
        assert_eq!(stats.non_ip_dropped, 0);
        assert_eq!(read_back(&path), frames);

        let expected = GLOBAL_HEADER_LEN
            + frames.iter().map(|f| RECORD_HEADER_LEN + f.len()).sum::<usize>();
        assert_eq!(fs::metadata(&path).unwrap().len(), expected as u64);
    }

    #[test]
    fn test_tcp_port_range_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range.pcap");

        let frames = vec![
            tcp_frame(80, 40000),
            tcp_frame(81, 40000),
            tcp_frame(82, 40000),
            udp_frame(80, 40000),
            arp_frame(),
        ];
        let mut writer = PcapFile::create(&path).unwrap();
        let filter = Filter::parse("tcp:80-81").unwrap();
        let stats = capture(&filter, &mut writer, &frames);
        writer.close().unwrap();

        assert_eq!(stats.packets_captured, 2);
        assert_eq!(stats.non_ip_dropped, 1);
        assert_eq!(read_back(&path), &frames[..2]);
    }

    #[test]
    fn test_destination_port_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dport.pcap");

        let frames = vec![
            udp_frame(40000, 53),
            udp_frame(53, 40000),
            tcp_frame(40000, 53),
        ];
        let mut writer = PcapFile::create(&path).unwrap();
        let filter = Filter::parse("dport:port:53").unwrap();
        let stats = capture(&filter, &mut writer, &frames);
        writer.close().unwrap();

        assert_eq!(stats.packets_captured, 2);
        assert_eq!(read_back(&path), vec![frames[0].clone(), frames[2].clone()]);
    }

    #[test]
    fn test_icmp_only_scenario_drops_non_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icmp.pcap");

        let frames = vec![icmp_frame(), tcp_frame(22, 40000), arp_frame()];
        let mut writer = PcapFile::create(&path).unwrap();
        let filter = Filter::parse("icmp").unwrap();
        let stats = capture(&filter, &mut writer, &frames);
        writer.close().unwrap();

        assert_eq!(stats.packets_captured, 1);
        assert_eq!(stats.non_ip_dropped, 1);
        assert_eq!(read_back(&path), vec![frames[0].clone()]);
    }

    #[test]
    fn test_preallocated_overflow_keeps_completed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealloc.pcap");

        // Room for the global header and exactly three 300-byte frames.
        let frame = {
            let mut udp = vec![0u8; 300 - ETH_HLEN - 20];
            udp[0..2].copy_from_slice(&53u16.to_be_bytes());
            eth_frame(ETHERTYPE_IPV4, &ipv4_packet(0x11, &udp))
        };
        assert_eq!(frame.len(), 300);

        let capacity = GLOBAL_HEADER_LEN + 3 * (RECORD_HEADER_LEN + frame.len());
        let mut writer = PcapFile::in_memory(capacity).unwrap();
        let filter = Filter::new();
        let mut stats = CaptureStats::default();

        let mut overflowed = false;
        for i in 0..5u32 {
            match handle_frame(&filter, &mut writer, &mut stats, &frame, i, 0) {
                Ok(()) => {}
                Err(CaptureError::BufferFull) => {
                    overflowed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert!(overflowed);
        assert_eq!(stats.packets_captured, 3);

        writer.flush_to(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), capacity as u64);
        assert_eq!(read_back(&path).len(), 3);
    }

    #[test]
    fn test_short_ipv4_frames_are_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pcap");

        let runt = eth_frame(ETHERTYPE_IPV4, &[0x45, 0, 0, 20]);
        // IHL claims 32 bytes of header but only 20 were captured.
        let bad_ihl = eth_frame(ETHERTYPE_IPV4, &{
            let mut ip = ipv4_packet(0x11, &[]);
            ip[0] = 0x48;
            ip
        });

        let mut writer = PcapFile::create(&path).unwrap();
        let stats = capture(&Filter::new(), &mut writer, &[runt, bad_ihl]);
        writer.close().unwrap();

        assert_eq!(stats.packets_captured, 0);
        assert!(read_back(&path).is_empty());
    }

    // ─── ring slot draining ───────────────────────────────────────────────

    /// Lay out a v3 block: descriptor, then packets chained by next_offset.
    fn build_v3_block(ring: &RingMap, frames: &[&[u8]]) {
        let first_pkt = 48usize;
        ring.fill(v3::BLOCK_NUM_PKTS, &(frames.len() as u32).to_ne_bytes());
        ring.fill(v3::BLOCK_FIRST_PKT, &(first_pkt as u32).to_ne_bytes());

        let mut off = first_pkt;
        for (i, frame) in frames.iter().enumerate() {
            let mac = 32u16;
            let next = (32 + frame.len() + 15) & !15;
            ring.fill(off + v3::PKT_NEXT_OFFSET, &(next as u32).to_ne_bytes());
            ring.fill(off + v3::PKT_SEC, &(7000 + i as u32).to_ne_bytes());
            ring.fill(off + v3::PKT_NSEC, &(5500u32).to_ne_bytes());
            ring.fill(off + v3::PKT_SNAPLEN, &(frame.len() as u32).to_ne_bytes());
            ring.fill(off + v3::PKT_MAC, &mac.to_ne_bytes());
            ring.fill(off + usize::from(mac), frame);
            off += next;
        }
    }

    #[test]
    fn test_drain_v3_block_walks_packet_chain() {
        let ring = RingMap::anonymous(BLOCK_SIZE);
        let frames = [tcp_frame(80, 1), udp_frame(53, 2), arp_frame()];
        build_v3_block(&ring, &[&frames[0], &frames[1], &frames[2]]);

        let mut seen = Vec::new();
        drain_slot(&ring, RingVersion::V3, 0, |eth, sec, usec| {
            seen.push((eth.to_vec(), sec, usec));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(seen[i].0, *frame);
            assert_eq!(seen[i].1, 7000 + i as u32);
            assert_eq!(seen[i].2, 5, "nanoseconds must convert to microseconds");
        }
    }

    #[test]
    fn test_drain_v2_frame() {
        let ring = RingMap::anonymous(BLOCK_SIZE);
        let frame = udp_frame(5353, 5353);
        let mac = 64u16;
        ring.fill(v2::SNAPLEN, &(frame.len() as u32).to_ne_bytes());
        ring.fill(v2::MAC, &mac.to_ne_bytes());
        ring.fill(v2::SEC, &123u32.to_ne_bytes());
        ring.fill(v2::NSEC, &999_999u32.to_ne_bytes());
        ring.fill(usize::from(mac), &frame);

        let mut seen = Vec::new();
        drain_slot(&ring, RingVersion::V2, 0, |eth, sec, usec| {
            seen.push((eth.to_vec(), sec, usec));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec![(frame, 123, 999)]);
    }

    #[test]
    fn test_drain_v1_frame_uses_microseconds_directly() {
        let ring = RingMap::anonymous(BLOCK_SIZE);
        let frame = icmp_frame();
        let mac = 64u16;
        ring.fill(v1::SNAPLEN, &(frame.len() as u32).to_ne_bytes());
        ring.fill(v1::MAC, &mac.to_ne_bytes());
        ring.fill(v1::SEC, &55u32.to_ne_bytes());
        ring.fill(v1::USEC, &777u32.to_ne_bytes());
        ring.fill(usize::from(mac), &frame);

        let mut seen = Vec::new();
        drain_slot(&ring, RingVersion::V1, 0, |eth, sec, usec| {
            seen.push((eth.to_vec(), sec, usec));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec![(frame, 55, 777)]);
    }
}

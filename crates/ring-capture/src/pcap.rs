//! Writer for the legacy pcap capture file format.
//!
//! 24-byte global header, then one 16-byte record header plus raw link-layer
//! bytes per packet, all in host byte order. Two sinks are supported: the
//! streaming sink appends records through an [`IncrementalFile`] as packets
//! arrive, the memory sink accumulates records in a [`PacketBuffer`] and
//! flushes the whole capture in a single vectored write at shutdown.
//!
//! Record headers carry the *captured* length in both length fields. That is
//! what the capture has always written and readers accept it, so the format
//! is kept bit-for-bit.

use std::fs::File;
use std::io::{IoSlice, Write};
use std::path::Path;

use crate::buffer::PacketBuffer;
use crate::error::{CaptureError, Result};
use crate::memfile::IncrementalFile;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

const MAGIC_NUMBER: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const THISZONE: i32 = 0;
const SIGFIGS: u32 = 0;
const SNAPLEN: u32 = 64 * 1024 - 1;
const LINKTYPE_ETHERNET: u32 = 1;

/// The global file header.
pub fn global_header() -> [u8; GLOBAL_HEADER_LEN] {
    let mut hdr = [0u8; GLOBAL_HEADER_LEN];
    hdr[0..4].copy_from_slice(&MAGIC_NUMBER.to_ne_bytes());
    hdr[4..6].copy_from_slice(&VERSION_MAJOR.to_ne_bytes());
    hdr[6..8].copy_from_slice(&VERSION_MINOR.to_ne_bytes());
    hdr[8..12].copy_from_slice(&THISZONE.to_ne_bytes());
    hdr[12..16].copy_from_slice(&SIGFIGS.to_ne_bytes());
    hdr[16..20].copy_from_slice(&SNAPLEN.to_ne_bytes());
    hdr[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_ne_bytes());
    hdr
}

fn record_header(ts_sec: u32, ts_usec: u32, captured_len: u32) -> [u8; RECORD_HEADER_LEN] {
    let mut hdr = [0u8; RECORD_HEADER_LEN];
    hdr[0..4].copy_from_slice(&ts_sec.to_ne_bytes());
    hdr[4..8].copy_from_slice(&ts_usec.to_ne_bytes());
    hdr[8..12].copy_from_slice(&captured_len.to_ne_bytes());
    hdr[12..16].copy_from_slice(&captured_len.to_ne_bytes());
    hdr
}

enum Sink {
    Stream(IncrementalFile),
    Memory(PacketBuffer),
}

/// A pcap capture in progress.
pub struct PcapFile {
    sink: Sink,
}

impl PcapFile {
    /// Streaming mode: create `path` and write the global header now;
    /// records follow as packets arrive.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = IncrementalFile::create(path)?;
        file.write(&global_header())?;
        Ok(Self { sink: Sink::Stream(file) })
    }

    #[cfg(test)]
    fn create_with_increment(path: &Path, increment: usize) -> Result<Self> {
        let mut file = IncrementalFile::create_with_increment(path, increment)?;
        file.write(&global_header())?;
        Ok(Self { sink: Sink::Stream(file) })
    }

    /// Preallocated mode: records accumulate in memory and the file is only
    /// produced by [`flush_to`]. The global header is not buffered but the
    /// cap covers it, so the record space is `capacity - 24`.
    ///
    /// [`flush_to`]: PcapFile::flush_to
    pub fn in_memory(capacity: usize) -> Result<Self> {
        if capacity < GLOBAL_HEADER_LEN {
            return Err(CaptureError::Config(format!(
                "preallocated capture size must be at least {GLOBAL_HEADER_LEN} bytes"
            )));
        }
        let buffer = PacketBuffer::allocate(capacity - GLOBAL_HEADER_LEN)?;
        Ok(Self { sink: Sink::Memory(buffer) })
    }

    /// Append one packet record.
    ///
    /// Streaming: all-or-nothing through the incremental writer. Memory: a
    /// record that does not fit the remaining space is refused with
    /// [`CaptureError::BufferFull`] and the buffer is left untouched.
    pub fn write_packet(&mut self, ts_sec: u32, ts_usec: u32, frame: &[u8]) -> Result<()> {
        let hdr = record_header(ts_sec, ts_usec, frame.len() as u32);
        match &mut self.sink {
            Sink::Stream(file) => {
                file.writev(&[IoSlice::new(&hdr), IoSlice::new(frame)])?;
            }
            Sink::Memory(buffer) => {
                if RECORD_HEADER_LEN + frame.len() > buffer.remaining() {
                    return Err(CaptureError::BufferFull);
                }
                buffer.put(&hdr);
                buffer.put(frame);
            }
        }
        Ok(())
    }

    /// Total capture bytes so far, global header included.
    pub fn bytes_written(&self) -> u64 {
        match &self.sink {
            Sink::Stream(file) => file.len(),
            Sink::Memory(buffer) => (GLOBAL_HEADER_LEN + buffer.len()) as u64,
        }
    }

    /// Preallocated-mode flush: create the final file and write the global
    /// header plus every buffered record as one gathered write.
    pub fn flush_to(&mut self, path: &Path) -> Result<()> {
        let Sink::Memory(buffer) = &self.sink else {
            return Err(CaptureError::Io(std::io::Error::other(
                "flush_to is only valid for a preallocated capture",
            )));
        };

        let mut file = File::create(path)?;
        let header = global_header();
        let result = write_all_vectored(
            &mut file,
            &mut [IoSlice::new(&header), IoSlice::new(buffer.as_slice())],
        );
        if result.is_err() {
            // Leave no half-written capture behind.
            let _ = std::fs::remove_file(path);
        }
        result
    }

    /// Close the streaming sink (truncating to the bytes written). A no-op
    /// for the memory sink and for an already-closed stream.
    pub fn close(&mut self) -> Result<()> {
        match &mut self.sink {
            Sink::Stream(file) => file.close(),
            Sink::Memory(_) => Ok(()),
        }
    }
}

/// Drive `write_vectored` until every segment is drained. A single writev
/// normally covers the whole capture; the loop only exists for short writes.
pub fn write_all_vectored<W: Write>(writer: &mut W, mut bufs: &mut [IoSlice<'_>]) -> Result<()> {
    let mut total: usize = bufs.iter().map(|b| b.len()).sum();
    while total > 0 {
        let n = writer.write_vectored(bufs)?;
        if n == 0 {
            return Err(CaptureError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        total -= n;
        IoSlice::advance_slices(&mut bufs, n);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::PcapReader;
    use std::fs;
    use std::time::Duration;

    const INC: usize = 64 * 1024;

    #[test]
    fn test_global_header_bytes() {
        let expected = [
            0xD4, 0xC3, 0xB2, 0xA1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        ];
        assert_eq!(global_header(), expected);
    }

    #[test]
    fn test_record_header_carries_captured_length_twice() {
        let hdr = record_header(32, 128, 3);
        let expected = [
            0x20, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(hdr, expected);
    }

    #[test]
    fn test_streaming_roundtrip_with_canonical_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.pcap");

        let frames: [&[u8]; 3] = [b"first frame", b"x", b"the third ethernet frame"];
        let mut pcap = PcapFile::create_with_increment(&path, INC).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            pcap.write_packet(100 + i as u32, 10 * i as u32, frame).unwrap();
        }
        let expected_len =
            GLOBAL_HEADER_LEN + frames.iter().map(|f| RECORD_HEADER_LEN + f.len()).sum::<usize>();
        assert_eq!(pcap.bytes_written(), expected_len as u64);
        pcap.close().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), expected_len as u64);

        let mut reader = PcapReader::new(fs::File::open(&path).unwrap()).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let pkt = reader.next_packet().unwrap().unwrap();
            assert_eq!(&*pkt.data, *frame);
            assert_eq!(pkt.orig_len, frame.len() as u32);
            assert_eq!(
                pkt.timestamp,
                Duration::new(100 + i as u64, 10_000 * i as u32)
            );
        }
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn test_memory_mode_flushes_header_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.pcap");

        let mut pcap = PcapFile::in_memory(1024).unwrap();
        pcap.write_packet(7, 9, b"abcdef").unwrap();
        pcap.write_packet(8, 0, b"ghij").unwrap();
        pcap.flush_to(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), GLOBAL_HEADER_LEN + 2 * RECORD_HEADER_LEN + 10);
        assert_eq!(&bytes[..GLOBAL_HEADER_LEN], &global_header());

        let mut reader = PcapReader::new(&bytes[..]).unwrap();
        assert_eq!(&*reader.next_packet().unwrap().unwrap().data, b"abcdef");
        assert_eq!(&*reader.next_packet().unwrap().unwrap().data, b"ghij");
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn test_memory_mode_refuses_overflowing_record() {
        // Room for the global header plus one 16+8 record, not two.
        let mut pcap = PcapFile::in_memory(GLOBAL_HEADER_LEN + 30).unwrap();
        pcap.write_packet(0, 0, b"12345678").unwrap();
        let err = pcap.write_packet(0, 0, b"12345678").unwrap_err();
        assert!(matches!(err, CaptureError::BufferFull));
        // The refused record must not have been half-buffered.
        assert_eq!(pcap.bytes_written(), (GLOBAL_HEADER_LEN + 24) as u64);
    }

    #[test]
    fn test_write_all_vectored_drains_every_segment() {
        let mut out = Vec::new();
        let header = [1u8; 5];
        let body = [2u8; 11];
        write_all_vectored(&mut out, &mut [IoSlice::new(&header), IoSlice::new(&body)]).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..5], &header);
        assert_eq!(&out[5..], &body);
    }
}

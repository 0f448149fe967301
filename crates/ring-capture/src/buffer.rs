//! Preallocated in-memory packet buffer.
//!
//! Used in preallocated capture mode: records accumulate here during the
//! run and are flushed to disk in one vectored write at shutdown. The
//! capacity is a hard cap: a `put` that would exceed it is refused and
//! nothing is copied.

use crate::error::{CaptureError, Result};

pub struct PacketBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl PacketBuffer {
    /// Reserve exactly `capacity` bytes up front. Allocation failure is
    /// reported, not aborted on.
    pub fn allocate(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|_| {
            CaptureError::Config(format!(
                "couldn't preallocate {capacity} bytes for the capture buffer"
            ))
        })?;
        Ok(Self { buf, capacity })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available before the cap.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append `bytes`; false (and no copy) if they don't fit.
    pub fn put(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_respects_capacity() {
        let mut b = PacketBuffer::allocate(8).unwrap();
        assert!(b.put(b"abcd"));
        assert!(b.put(b"efgh"));
        assert_eq!(b.remaining(), 0);
        assert!(!b.put(b"x"));
        assert_eq!(b.as_slice(), b"abcdefgh");
    }

    #[test]
    fn test_refused_put_copies_nothing() {
        let mut b = PacketBuffer::allocate(4).unwrap();
        assert!(b.put(b"ab"));
        assert!(!b.put(b"cde"));
        assert_eq!(b.len(), 2);
        assert_eq!(b.as_slice(), b"ab");
    }
}

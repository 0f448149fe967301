//! Append-only file writer backed by a sliding mmap window.
//!
//! The backing file grows in fixed 256 MiB increments (`ftruncate`), and only
//! the increment currently being filled is mapped. Appends are plain memory
//! copies into the window; crossing an increment boundary unmaps, extends the
//! file and remaps at the new offset. `close` truncates the file down to the
//! bytes actually written.
//!
//! One window at a time bounds the virtual-memory footprint no matter how
//! large the capture grows, and the coarse extension granularity keeps
//! append throughput steady on filesystems that penalize many small
//! `ftruncate` calls.

use std::fs::{File, OpenOptions};
use std::io::IoSlice;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use tracing::debug;

use crate::error::{CaptureError, Result};

/// Growth step and mapping-window size.
pub const FILE_INCREMENT: usize = 256 * 1024 * 1024;

pub struct IncrementalFile {
    file: Option<File>,
    /// Mapping of the increment containing the write cursor; null when the
    /// window has been torn down (during growth, or after close).
    map: *mut u8,
    increment: usize,
    /// Allocated file size (multiple of `increment`).
    physical_size: u64,
    /// Logical append offset; the file is truncated to this on close.
    offset: u64,
    /// Number of grow-and-remap cycles performed, for diagnostics.
    grows: u32,
}

impl IncrementalFile {
    /// Create (or truncate) `path` and map the first increment.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_increment(path, FILE_INCREMENT)
    }

    /// Same, with a caller-chosen increment. Must be a multiple of the page
    /// size; exposed so tests can cross window boundaries cheaply.
    pub fn create_with_increment(path: &Path, increment: usize) -> Result<Self> {
        // MAP_SHARED + PROT_WRITE requires the fd to be opened for reading
        // as well as writing, or mmap fails with EACCES.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut this = Self {
            file: Some(file),
            map: ptr::null_mut(),
            increment,
            physical_size: 0,
            offset: 0,
            grows: 0,
        };
        this.grow()?;
        Ok(this)
    }

    /// Logical length: the number of bytes appended so far.
    pub fn len(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Append all of `buf`. Either every byte lands or the logical offset is
    /// rolled back to where it was and an error is returned; partial appends
    /// are never observable.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let start = self.offset;
        self.append(buf).map_err(|e| {
            self.offset = start;
            e
        })?;
        Ok(buf.len())
    }

    /// Append segments in order with the same all-or-nothing contract as
    /// `write`; returns the total byte count on success.
    pub fn writev(&mut self, segments: &[IoSlice<'_>]) -> Result<usize> {
        let start = self.offset;
        let mut total = 0usize;
        for seg in segments {
            if let Err(e) = self.append(seg) {
                self.offset = start;
                return Err(e);
            }
            total += seg.len();
        }
        Ok(total)
    }

    fn append(&mut self, buf: &[u8]) -> Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let left = (self.physical_size - self.offset) as usize;
            if left == 0 {
                self.grow()?;
                continue;
            }

            let n = rest.len().min(left);
            let window_off = (self.offset % self.increment as u64) as usize;
            // The window spans exactly one increment and window_off + n never
            // exceeds it: `left` is bounded by the bytes remaining in the
            // current increment.
            unsafe {
                ptr::copy_nonoverlapping(rest.as_ptr(), self.map.add(window_off), n);
            }
            self.offset += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Unmap the full window, extend the file by one increment and map a
    /// fresh window starting at the current logical offset.
    fn grow(&mut self) -> Result<()> {
        self.unmap();

        let file = self
            .file
            .as_ref()
            .ok_or_else(|| CaptureError::Io(std::io::Error::other("file already closed")))?;

        let physical = self.physical_size + self.increment as u64;
        file.set_len(physical)?;
        self.physical_size = physical;

        // offset is a multiple of the increment here: growth only happens
        // when the previous window has been filled completely.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.increment,
                libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                self.offset as libc::off_t,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(CaptureError::Io(std::io::Error::last_os_error()));
        }

        self.map = map as *mut u8;
        self.grows += 1;
        debug!(physical, offset = self.offset, "extended capture file");
        Ok(())
    }

    fn unmap(&mut self) {
        if !self.map.is_null() {
            unsafe {
                libc::munmap(self.map as *mut libc::c_void, self.increment);
            }
            self.map = ptr::null_mut();
        }
    }

    /// Unmap, truncate to the logical length and close the descriptor.
    /// Calling close again is a no-op that reports success.
    pub fn close(&mut self) -> Result<()> {
        self.unmap();
        if let Some(file) = self.file.take() {
            file.set_len(self.offset)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn grow_count(&self) -> u32 {
        self.grows
    }
}

impl Drop for IncrementalFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

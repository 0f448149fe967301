//! Unified error type for the capture pipeline.

use std::io;

/// Everything that can go wrong between argument validation and the final
/// flush. Each variant maps to a distinct failure domain; the binary wraps
/// these in `anyhow` context at the top level.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Invalid configuration, rejected before any OS resource is touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed filter expression. The filter is left empty.
    #[error("invalid filter: {0}")]
    Filter(String),

    /// A socket/setsockopt/ioctl/mmap/bind step of the setup sequence failed.
    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// File creation, truncation, mapping or write failure during capture.
    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),

    /// The preallocated capture buffer cannot hold the next packet.
    #[error("preallocated capture buffer is full")]
    BufferFull,
}

impl CaptureError {
    /// Setup-phase failure carrying the OS error that caused it.
    pub(crate) fn setup(context: &'static str, source: io::Error) -> Self {
        CaptureError::Setup { context, source }
    }

    /// Setup-phase failure from the calling thread's current `errno`.
    pub(crate) fn last_os(context: &'static str) -> Self {
        Self::setup(context, io::Error::last_os_error())
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

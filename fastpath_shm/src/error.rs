//! Error types for segment and FIFO operations.

use thiserror::Error;

/// Errors raised while establishing, attaching, or tearing down a shared
/// segment, or while allocating from its embedded heap.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment was configured with a zero size
    #[error("segment '{name}' configured with zero size")]
    NoSize {
        /// Segment name
        name: String,
    },

    /// Segment size outside the supported range
    #[error("invalid segment size: {size} bytes (must be 8KB-1GB)")]
    InvalidSize {
        /// Requested size in bytes
        size: u64,
    },

    /// Backing object could not be created
    #[error("failed to create segment '{name}': {source}")]
    CreateFailure {
        /// Segment name
        name: String,
        /// OS-level reason
        source: std::io::Error,
    },

    /// Backing object could not be sized
    #[error("failed to size segment '{name}': {source}")]
    SetSize {
        /// Segment name
        name: String,
        /// OS-level reason
        source: std::io::Error,
    },

    /// Mapping the segment into this address space failed
    #[error("mmap failed for segment '{name}': {source}")]
    Mmap {
        /// Segment name
        name: String,
        /// OS-level reason
        source: std::io::Error,
    },

    /// Client attach loop exhausted its countdown
    #[error("client attach timed out for segment '{name}'")]
    ClientTimeout {
        /// Segment name
        name: String,
    },

    /// Attach was requested on a segment type that only supports the
    /// server role (private segments)
    #[error("segment type for '{name}' cannot be attached by a client")]
    ServerOnly {
        /// Segment name
        name: String,
    },

    /// Embedded heap could not satisfy an allocation
    #[error("segment heap exhausted: {requested} bytes requested, {available} available")]
    HeapExhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes still free
        available: usize,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for segment and heap operations.
pub type ShmResult<T> = Result<T, ShmError>;

/// Steady-state FIFO results, expected during normal operation and always
/// non-destructive: the caller decides whether to retry or back off.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// Not enough free space for the requested enqueue
    #[error("fifo full")]
    Full,
    /// Nothing to dequeue
    #[error("fifo empty")]
    Empty,
}

//! Cross-process record layouts.
//!
//! Defines the segment type tag persisted in every shared header and the
//! fixed 16-byte buffer descriptor record that the buffer-descriptor FIFO
//! writes per enqueue. Both are `#[repr(C)]` and layout-locked: a change
//! here is a wire-format change.

use static_assertions::const_assert_eq;

/// Backing mechanism of a shared segment.
///
/// The tag is persisted as a `u32` at offset 0 of the shared header so
/// that teardown can dispatch even when the caller holds only a segment
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentType {
    /// POSIX shared-memory object, named under `/dev/shm`.
    Shm = 0,
    /// Anonymous file descriptor, transferable over a socket.
    Memfd = 1,
    /// Process-local anonymous mapping; no cross-process anchor.
    Private = 2,
}

impl SegmentType {
    /// Convert from the raw tag value. Returns `None` for invalid tags.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Shm),
            1 => Some(Self::Memfd),
            2 => Some(Self::Private),
            _ => None,
        }
    }
}

/// Buffer descriptor record - exactly the bytes written into the FIFO's
/// byte ring per enqueue.
///
/// `start` is the producer's logical payload index (`tail2`) at enqueue
/// time, before advancement; `length` is the total byte length of the
/// chain rooted at `buffer_index` at enqueue time. `debug` carries a
/// producer-local sequence stamp used only in corruption diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BufferDesc {
    /// Buffer-pool index of the chain's root node.
    pub buffer_index: u32,
    /// Logical payload stream position at which this chain begins.
    pub start: u32,
    /// Total chain length in bytes.
    pub length: u32,
    /// Producer-local sequence stamp.
    pub debug: u32,
}

/// Size of one descriptor record on the ring.
pub const BUFFER_DESC_SIZE: usize = core::mem::size_of::<BufferDesc>();

const_assert_eq!(BUFFER_DESC_SIZE, 16);
const_assert_eq!(core::mem::align_of::<BufferDesc>(), 4);

impl BufferDesc {
    /// Serialize to the on-ring byte representation (native endianness;
    /// both sides run on the same machine).
    #[inline]
    pub fn to_bytes(&self) -> [u8; BUFFER_DESC_SIZE] {
        let mut out = [0u8; BUFFER_DESC_SIZE];
        out[0..4].copy_from_slice(&self.buffer_index.to_ne_bytes());
        out[4..8].copy_from_slice(&self.start.to_ne_bytes());
        out[8..12].copy_from_slice(&self.length.to_ne_bytes());
        out[12..16].copy_from_slice(&self.debug.to_ne_bytes());
        out
    }

    /// Deserialize from the on-ring byte representation.
    #[inline]
    pub fn from_bytes(bytes: &[u8; BUFFER_DESC_SIZE]) -> Self {
        Self {
            buffer_index: u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            start: u32::from_ne_bytes(bytes[4..8].try_into().unwrap()),
            length: u32::from_ne_bytes(bytes[8..12].try_into().unwrap()),
            debug: u32::from_ne_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

//! Page-zero shared header.
//!
//! The durable metadata of every segment. The creator populates every
//! field except `ready`, then publishes; the attacher reads `base_va`
//! and `size` from a one-page probe mapping, re-maps, and stamps its
//! pid. After initialization the only mutable fields are `client_pid`
//! (written once by the attacher) and `ready` (written once by the
//! creator).

use fastpath_common::{NO_BASE_VA, SegmentType};
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// In-segment header at offset 0. The embedded heap begins at
/// `segment_base + page_size`.
#[repr(C, align(64))]
pub struct SharedHeader {
    seg_type: u32,
    _pad0: u32,
    size: u64,
    base_va: u64,
    server_pid: i32,
    client_pid: AtomicI32,
    ready: AtomicU32,
    _pad1: u32,
    heap: u64,
    name_ptr: u64,
    name_len: u32,
    _pad2: u32,
}

const_assert_eq!(core::mem::size_of::<SharedHeader>(), 64);
const_assert_eq!(core::mem::align_of::<SharedHeader>(), 64);

impl SharedHeader {
    /// Write a fresh header at `ptr`. `ready` starts unset; the heap and
    /// name are filled in by the caller once the heap exists.
    ///
    /// # Safety
    /// `ptr` must reference at least one zeroed, writable, cache-line
    /// aligned page.
    pub unsafe fn init(
        ptr: NonNull<SharedHeader>,
        seg_type: SegmentType,
        size: u64,
        base_va: u64,
        server_pid: i32,
    ) -> &'static mut SharedHeader {
        unsafe {
            ptr.as_ptr().write(SharedHeader {
                seg_type: seg_type as u32,
                _pad0: 0,
                size,
                base_va,
                server_pid,
                client_pid: AtomicI32::new(0),
                ready: AtomicU32::new(0),
                _pad1: 0,
                heap: 0,
                name_ptr: 0,
                name_len: 0,
                _pad2: 0,
            });
            &mut *ptr.as_ptr()
        }
    }

    /// Backing type tag. `None` if the header bytes are not a header.
    pub fn seg_type(&self) -> Option<SegmentType> {
        SegmentType::from_u32(self.seg_type)
    }

    /// Total segment size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Virtual address the creator mapped the segment at; the anchor
    /// every attacher must re-map to. [`NO_BASE_VA`] for private
    /// segments.
    pub fn base_va(&self) -> u64 {
        self.base_va
    }

    /// Whether this segment can be re-mapped by another process.
    pub fn has_anchor(&self) -> bool {
        self.base_va != NO_BASE_VA
    }

    /// Creator pid.
    pub fn server_pid(&self) -> i32 {
        self.server_pid
    }

    /// Attacher pid; 0 until a client attaches.
    pub fn client_pid(&self) -> i32 {
        self.client_pid.load(Ordering::Acquire)
    }

    /// Stamp the attacher pid. Called exactly once, by the attacher.
    pub fn set_client_pid(&self, pid: i32) {
        self.client_pid.store(pid, Ordering::Release);
    }

    /// Record the embedded heap handle.
    pub fn set_heap(&mut self, heap: u64) {
        self.heap = heap;
    }

    /// Address of the embedded heap header.
    pub fn heap(&self) -> u64 {
        self.heap
    }

    /// Record the segment name (bytes previously copied into the heap).
    pub fn set_name(&mut self, ptr: u64, len: u32) {
        self.name_ptr = ptr;
        self.name_len = len;
    }

    /// Segment name as stored in the heap. Empty before the creator
    /// records it.
    pub fn name(&self) -> &[u8] {
        if self.name_ptr == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.name_ptr as *const u8, self.name_len as usize) }
    }

    /// Publish readiness. Release-ordered: every prior write to the
    /// segment (header fields, heap contents, application setup) is
    /// visible to any attacher that observes readiness.
    pub fn publish_ready(&self) {
        self.ready.store(1, Ordering::Release);
    }

    /// Acquire-ordered readiness probe. Until this returns true an
    /// attacher must not touch anything past `seg_type`, `base_va`,
    /// `size` and `ready` itself.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{map_anonymous, unmap};

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<SharedHeader>(), 64);
    }

    #[test]
    fn test_header_init_and_publish() {
        let base = map_anonymous(4096).unwrap();
        let hdr = unsafe {
            SharedHeader::init(base.cast(), SegmentType::Shm, 1 << 20, 0x7000_0000, 1234)
        };

        assert_eq!(hdr.seg_type(), Some(SegmentType::Shm));
        assert_eq!(hdr.size(), 1 << 20);
        assert_eq!(hdr.base_va(), 0x7000_0000);
        assert_eq!(hdr.server_pid(), 1234);
        assert_eq!(hdr.client_pid(), 0);
        assert!(!hdr.is_ready());

        hdr.publish_ready();
        assert!(hdr.is_ready());

        hdr.set_client_pid(5678);
        assert_eq!(hdr.client_pid(), 5678);

        unmap(base, 4096);
    }

    #[test]
    fn test_private_header_has_no_anchor() {
        let base = map_anonymous(4096).unwrap();
        let hdr = unsafe {
            SharedHeader::init(base.cast(), SegmentType::Private, 4096, NO_BASE_VA, 1)
        };
        assert!(!hdr.has_anchor());
        unmap(base, 4096);
    }
}

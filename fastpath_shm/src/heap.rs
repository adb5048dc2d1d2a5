//! Embedded heap formatted into a mapped region.
//!
//! Every segment dedicates its first page to the shared header; the heap
//! occupies the remainder. Allocation state lives inside the region
//! itself, so after an attacher re-maps at the creator's address both
//! processes can allocate, and every pointer handed out is valid on both
//! sides.

use crate::error::{ShmError, ShmResult};
use fastpath_common::CACHE_LINE_SIZE;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

const HEAP_MAGIC: u32 = 0x4650_4831; // "FPH1"

/// Allocator state at the start of the heap region.
#[repr(C, align(64))]
struct HeapHeader {
    magic: u32,
    /// Usable bytes following this header.
    size: u32,
    /// Offset of the next free byte within the usable area.
    bump: AtomicU32,
    _padding: [u8; 52],
}

const_assert_eq!(core::mem::size_of::<HeapHeader>(), CACHE_LINE_SIZE);

/// Handle to a heap living inside a mapped region.
///
/// Copyable; the real state is behind the pointer. Rebuild a handle on
/// the attaching side with [`SharedHeap::from_raw`] using the address
/// published in the segment's shared header.
#[derive(Clone, Copy)]
pub struct SharedHeap {
    hdr: NonNull<HeapHeader>,
}

// The handle is only a pointer into a mapping that outlives it; the
// allocator itself is guarded by the CAS on `bump`.
unsafe impl Send for SharedHeap {}
unsafe impl Sync for SharedHeap {}

impl SharedHeap {
    /// Format a new heap over `size` bytes at `base`.
    ///
    /// # Safety-relevant contract
    /// `base` must point at a writable mapping of at least `size` bytes,
    /// aligned to a cache line, and no other heap may already live there.
    pub fn create(base: NonNull<u8>, size: usize) -> ShmResult<Self> {
        let hdr_size = core::mem::size_of::<HeapHeader>();
        if size <= hdr_size || size - hdr_size > u32::MAX as usize {
            return Err(ShmError::HeapExhausted {
                requested: hdr_size,
                available: 0,
            });
        }

        let hdr = base.cast::<HeapHeader>();
        unsafe {
            hdr.as_ptr().write(HeapHeader {
                magic: HEAP_MAGIC,
                size: (size - hdr_size) as u32,
                bump: AtomicU32::new(0),
                _padding: [0; 52],
            });
        }
        Ok(Self { hdr })
    }

    /// Rebuild a handle from the address stored in a shared header.
    ///
    /// # Safety
    /// `addr` must be the address of a heap previously formatted by
    /// [`SharedHeap::create`] and still mapped in this process.
    pub unsafe fn from_raw(addr: u64) -> ShmResult<Self> {
        let hdr = NonNull::new(addr as *mut HeapHeader).ok_or_else(|| ShmError::Io {
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "null heap address"),
        })?;
        if unsafe { hdr.as_ref() }.magic != HEAP_MAGIC {
            return Err(ShmError::Io {
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad heap magic"),
            });
        }
        Ok(Self { hdr })
    }

    /// Address of the heap header, as published in the shared header.
    pub fn as_raw(&self) -> u64 {
        self.hdr.as_ptr() as u64
    }

    fn header(&self) -> &HeapHeader {
        unsafe { self.hdr.as_ref() }
    }

    fn area_base(&self) -> *mut u8 {
        unsafe { self.hdr.as_ptr().cast::<u8>().add(core::mem::size_of::<HeapHeader>()) }
    }

    /// Allocate `nbytes` with the given power-of-two alignment.
    ///
    /// Lock-free: a CAS loop on the bump offset is the reentrancy guard.
    /// Allocations are never returned individually; the whole heap goes
    /// away with the segment.
    pub fn alloc(&self, nbytes: usize, align: usize) -> ShmResult<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let hdr = self.header();
        let size = hdr.size as usize;

        let mut claimed = 0usize;
        let result = hdr.bump.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let start = (cur as usize + align - 1) & !(align - 1);
            let end = start.checked_add(nbytes)?;
            if end > size {
                return None;
            }
            claimed = start;
            Some(end as u32)
        });

        match result {
            Ok(_) => {
                let ptr = unsafe { self.area_base().add(claimed) };
                Ok(unsafe { NonNull::new_unchecked(ptr) })
            }
            Err(used) => Err(ShmError::HeapExhausted {
                requested: nbytes,
                available: size - used as usize,
            }),
        }
    }

    /// Allocate and copy `bytes`, returning the shared-memory address and
    /// length (used for the header name).
    pub fn alloc_bytes(&self, bytes: &[u8]) -> ShmResult<(u64, u32)> {
        let dst = self.alloc(bytes.len().max(1), 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Ok((dst.as_ptr() as u64, bytes.len() as u32))
    }

    /// Bytes still available for allocation.
    pub fn free_space(&self) -> usize {
        let hdr = self.header();
        hdr.size as usize - hdr.bump.load(Ordering::Acquire) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{map_anonymous, unmap};

    #[test]
    fn test_heap_create_and_alloc() {
        let base = map_anonymous(16384).unwrap();
        let heap = SharedHeap::create(base, 16384).unwrap();

        let total = heap.free_space();
        let a = heap.alloc(100, 8).unwrap();
        let b = heap.alloc(100, 8).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert!(heap.free_space() <= total - 200);

        unmap(base, 16384);
    }

    #[test]
    fn test_heap_exhaustion() {
        let base = map_anonymous(4096).unwrap();
        let heap = SharedHeap::create(base, 4096).unwrap();

        assert!(heap.alloc(1024, 8).is_ok());
        let err = heap.alloc(1 << 20, 8).unwrap_err();
        assert!(matches!(err, ShmError::HeapExhausted { .. }));
        // Failed allocation consumed nothing.
        assert!(heap.alloc(1024, 8).is_ok());

        unmap(base, 4096);
    }

    #[test]
    fn test_heap_handle_round_trip() {
        let base = map_anonymous(8192).unwrap();
        let heap = SharedHeap::create(base, 8192).unwrap();
        let raw = heap.as_raw();

        let again = unsafe { SharedHeap::from_raw(raw) }.unwrap();
        assert_eq!(again.free_space(), heap.free_space());

        unmap(base, 8192);
    }

    #[test]
    fn test_alloc_bytes_copies() {
        let base = map_anonymous(8192).unwrap();
        let heap = SharedHeap::create(base, 8192).unwrap();

        let (addr, len) = heap.alloc_bytes(b"ring0").unwrap();
        let copied = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
        assert_eq!(copied, b"ring0");

        unmap(base, 8192);
    }
}

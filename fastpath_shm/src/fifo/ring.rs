//! In-segment SPSC control block and raw byte-ring primitives.
//!
//! The control block carries two index pairs over one data area: the
//! byte-stream indices `head`/`tail` address the ring bytes themselves
//! (descriptor records live there), while `head2`/`tail2` are logical
//! payload counters that never address ring memory - they track bytes
//! living in externally-owned buffer chains. All four are free-running
//! `u32` with wraparound; positions are masked into the power-of-two
//! data area.
//!
//! Index discipline: each side stores only its own indices, with release
//! ordering, and loads the opposite side's with acquire. Free space can
//! only grow during an enqueue and current size can only grow during a
//! dequeue, which is what lets both sides decide without locks.

use crate::error::{FifoError, ShmResult};
use crate::heap::SharedHeap;
use bitflags::bitflags;
use fastpath_common::CACHE_LINE_SIZE;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// FIFO mode flags, stored in the shared control block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FifoFlags: u32 {
        /// The ring carries 16-byte buffer descriptors; payload bytes
        /// live in externally-owned chains tracked by `head2`/`tail2`.
        const CARRIES_BUFFERS = 1 << 0;
    }
}

/// Shared control block; the data area follows it immediately.
#[repr(C, align(64))]
pub struct FifoShared {
    capacity: u32,
    flags: u32,
    _pad0: [u8; 56],
    // Consumer-owned line.
    head: AtomicU32,
    head2: AtomicU32,
    _pad1: [u8; 56],
    // Producer-owned line.
    tail: AtomicU32,
    tail2: AtomicU32,
    _pad2: [u8; 56],
}

const_assert_eq!(core::mem::size_of::<FifoShared>(), 3 * CACHE_LINE_SIZE);

/// Bytes between two free-running indices, wraparound-correct.
#[inline]
pub fn cursize(head: u32, tail: u32) -> u32 {
    tail.wrapping_sub(head)
}

impl FifoShared {
    /// Allocate and format a control block plus data area inside a
    /// segment heap. `capacity` must be a power of two.
    pub fn create_in(
        heap: &SharedHeap,
        capacity: u32,
        flags: FifoFlags,
    ) -> ShmResult<NonNull<FifoShared>> {
        assert!(
            capacity.is_power_of_two(),
            "fifo capacity must be a power of two"
        );

        let total = core::mem::size_of::<FifoShared>() + capacity as usize;
        let block = heap.alloc(total, CACHE_LINE_SIZE)?;
        let shr = block.cast::<FifoShared>();
        unsafe {
            shr.as_ptr().write(FifoShared {
                capacity,
                flags: flags.bits(),
                _pad0: [0; 56],
                head: AtomicU32::new(0),
                head2: AtomicU32::new(0),
                _pad1: [0; 56],
                tail: AtomicU32::new(0),
                tail2: AtomicU32::new(0),
                _pad2: [0; 56],
            });
        }
        Ok(shr)
    }

    /// Data-area capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Mode flags.
    pub fn flags(&self) -> FifoFlags {
        FifoFlags::from_bits_truncate(self.flags)
    }

    /// Whether this ring carries buffer descriptors.
    pub fn carries_buffers(&self) -> bool {
        self.flags().contains(FifoFlags::CARRIES_BUFFERS)
    }

    /// Byte-stream indices as seen by the producer: the opposite side's
    /// head with acquire, its own tail relaxed.
    #[inline]
    pub fn load_bytes_prod(&self) -> (u32, u32) {
        (
            self.head.load(Ordering::Acquire),
            self.tail.load(Ordering::Relaxed),
        )
    }

    /// Byte-stream indices as seen by the consumer.
    #[inline]
    pub fn load_bytes_cons(&self) -> (u32, u32) {
        (
            self.head.load(Ordering::Relaxed),
            self.tail.load(Ordering::Acquire),
        )
    }

    /// Payload indices as seen by the producer.
    #[inline]
    pub fn load_payload_prod(&self) -> (u32, u32) {
        (
            self.head2.load(Ordering::Acquire),
            self.tail2.load(Ordering::Relaxed),
        )
    }

    /// Payload indices as seen by the consumer.
    #[inline]
    pub fn load_payload_cons(&self) -> (u32, u32) {
        (
            self.head2.load(Ordering::Relaxed),
            self.tail2.load(Ordering::Acquire),
        )
    }

    /// Publish the producer's payload index. Release-ordered so a
    /// consumer that observes the new tail also observes every
    /// descriptor byte written before it.
    #[inline]
    pub fn store_tail2(&self, value: u32) {
        self.tail2.store(value, Ordering::Release);
    }

    /// Publish the consumer's payload index - the authoritative
    /// bytes-consumed counter.
    #[inline]
    pub fn store_head2(&self, value: u32) {
        self.head2.store(value, Ordering::Release);
    }
}

/// Copyable view over a shared control block; the byte-ring primitive
/// the descriptor layer is built on. Data-area access goes through the
/// raw pointer, never through a reference, because the peer process
/// mutates the same bytes.
#[derive(Clone, Copy)]
pub struct Ring {
    shr: NonNull<FifoShared>,
}

unsafe impl Send for Ring {}

impl Ring {
    /// Wrap a control block created by [`FifoShared::create_in`] (or
    /// found through a segment's published pointers).
    ///
    /// # Safety
    /// `shr` must point at a formatted control block whose data area is
    /// mapped in this process.
    pub unsafe fn from_raw(shr: NonNull<FifoShared>) -> Self {
        Self { shr }
    }

    /// The shared control block.
    pub fn shared(&self) -> &FifoShared {
        unsafe { self.shr.as_ref() }
    }

    fn data(&self) -> *mut u8 {
        unsafe {
            self.shr
                .as_ptr()
                .cast::<u8>()
                .add(core::mem::size_of::<FifoShared>())
        }
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.shared().capacity() - 1
    }

    fn copy_in(&self, pos: u32, src: &[u8]) {
        let cap = self.shared().capacity() as usize;
        let at = (pos & self.mask()) as usize;
        let first = src.len().min(cap - at);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(at), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data(),
                    src.len() - first,
                );
            }
        }
    }

    fn copy_out(&self, pos: u32, dst: &mut [u8]) {
        let cap = self.shared().capacity() as usize;
        let at = (pos & self.mask()) as usize;
        let first = dst.len().min(cap - at);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(at), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.data(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }

    /// Producer-side: append `src` to the byte stream. Fails whole, and
    /// leaves the ring untouched, when free space is short.
    pub fn enqueue_bytes(&self, src: &[u8]) -> Result<(), FifoError> {
        let shr = self.shared();
        let (head, tail) = shr.load_bytes_prod();
        let free = shr.capacity() - cursize(head, tail);
        if (free as usize) < src.len() {
            return Err(FifoError::Full);
        }

        self.copy_in(tail, src);
        shr.tail.store(tail.wrapping_add(src.len() as u32), Ordering::Release);
        Ok(())
    }

    /// Consumer-side: remove exactly `dst.len()` bytes from the byte
    /// stream. Fails whole when fewer bytes are available.
    pub fn dequeue_bytes(&self, dst: &mut [u8]) -> Result<(), FifoError> {
        let shr = self.shared();
        let (head, tail) = shr.load_bytes_cons();
        if (cursize(head, tail) as usize) < dst.len() {
            return Err(FifoError::Empty);
        }

        self.copy_out(head, dst);
        shr.head.store(head.wrapping_add(dst.len() as u32), Ordering::Release);
        Ok(())
    }

    /// Consumer-side: read `dst.len()` bytes starting `offset` bytes
    /// past the head, without consuming.
    pub fn peek_bytes(&self, offset: u32, dst: &mut [u8]) -> Result<(), FifoError> {
        let shr = self.shared();
        let (head, tail) = shr.load_bytes_cons();
        let avail = cursize(head, tail);
        if (avail as usize) < offset as usize + dst.len() {
            return Err(FifoError::Empty);
        }

        self.copy_out(head.wrapping_add(offset), dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{map_anonymous, unmap};

    fn scratch_ring(capacity: u32) -> (Ring, NonNull<u8>, usize) {
        let map_size = 64 * 1024;
        let base = map_anonymous(map_size).unwrap();
        let heap = SharedHeap::create(base, map_size).unwrap();
        let shr = FifoShared::create_in(&heap, capacity, FifoFlags::empty()).unwrap();
        (unsafe { Ring::from_raw(shr) }, base, map_size)
    }

    #[test]
    fn test_byte_round_trip() {
        let (ring, base, map_size) = scratch_ring(64);

        ring.enqueue_bytes(b"hello world").unwrap();
        let mut out = [0u8; 11];
        ring.dequeue_bytes(&mut out).unwrap();
        assert_eq!(&out, b"hello world");

        unmap(base, map_size);
    }

    #[test]
    fn test_wraparound_copy() {
        let (ring, base, map_size) = scratch_ring(16);

        // Advance the indices near the wrap point, then cross it.
        for _ in 0..3 {
            ring.enqueue_bytes(&[7u8; 5]).unwrap();
            let mut out = [0u8; 5];
            ring.dequeue_bytes(&mut out).unwrap();
        }
        let pattern: Vec<u8> = (0..10).collect();
        ring.enqueue_bytes(&pattern).unwrap();
        let mut out = [0u8; 10];
        ring.dequeue_bytes(&mut out).unwrap();
        assert_eq!(out.as_slice(), pattern.as_slice());

        unmap(base, map_size);
    }

    #[test]
    fn test_full_and_empty_are_non_destructive() {
        let (ring, base, map_size) = scratch_ring(16);

        ring.enqueue_bytes(&[1u8; 16]).unwrap();
        assert_eq!(ring.enqueue_bytes(&[2u8; 1]), Err(FifoError::Full));

        let mut out = [0u8; 16];
        ring.dequeue_bytes(&mut out).unwrap();
        assert_eq!(out, [1u8; 16]);
        assert_eq!(ring.dequeue_bytes(&mut [0u8; 1]), Err(FifoError::Empty));

        unmap(base, map_size);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (ring, base, map_size) = scratch_ring(32);

        ring.enqueue_bytes(b"abcdef").unwrap();
        let mut p = [0u8; 4];
        ring.peek_bytes(2, &mut p).unwrap();
        assert_eq!(&p, b"cdef");

        let mut out = [0u8; 6];
        ring.dequeue_bytes(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");

        unmap(base, map_size);
    }

    #[test]
    fn test_index_wraparound_arithmetic() {
        assert_eq!(cursize(u32::MAX - 1, 2), 4);
        assert_eq!(cursize(5, 5), 0);
    }
}

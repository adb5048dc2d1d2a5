//! Buffer-descriptor FIFO.
//!
//! A single-producer/single-consumer byte ring extended to carry
//! references to externally-owned buffer chains. Each enqueue writes a
//! fixed 16-byte descriptor onto the ring; the payload itself stays in
//! pool-owned chains addressed by 32-bit index. The logical payload
//! indices `head2`/`tail2` are the only availability signal between the
//! sides: a consumer that observes a new `tail2` is guaranteed to find
//! the descriptors covering it.
//!
//! The producer and consumer roles are separate types, which is what
//! makes the SPSC discipline hold: each handle mutates only its own
//! indices and its own private state.

pub mod ooo;
pub mod ring;

pub use ring::{FifoFlags, FifoShared, Ring};

use crate::buffer::{BufferFlags, BufferPool};
use crate::error::{FifoError, ShmResult};
use crate::heap::SharedHeap;
use fastpath_common::{BUFFER_DESC_SIZE, BufferDesc};
use ooo::OooList;
use ring::cursize;
use std::ptr::NonNull;

/// Create a descriptor FIFO inside a segment heap and return both role
/// handles. In a cross-process deployment each side constructs its own
/// handle from the published control-block address instead.
pub fn create_pair(
    heap: &SharedHeap,
    capacity: u32,
    carries_buffers: bool,
) -> ShmResult<(FifoProducer, FifoConsumer)> {
    let flags = if carries_buffers {
        FifoFlags::CARRIES_BUFFERS
    } else {
        FifoFlags::empty()
    };
    let shr = FifoShared::create_in(heap, capacity, flags)?;
    Ok(unsafe { (FifoProducer::from_raw(shr), FifoConsumer::from_raw(shr)) })
}

/// Copy `dst.len()` bytes out of the chain rooted at `root`, starting
/// `pos` bytes into the chain's logical payload. Returns the bytes
/// actually copied; short only when the chain is shorter than its
/// descriptor advertised.
fn copy_from_chain(pool: &BufferPool, root: u32, pos: u32, dst: &mut [u8]) -> u32 {
    let mut chain_in_off = 0u32;
    let mut bi = root;
    let mut copied = 0u32;

    while (copied as usize) < dst.len() {
        let b = pool.get(bi);
        let node_end = chain_in_off + b.current_length;
        let cursor = pos + copied;

        if node_end <= cursor {
            // Node lies entirely before the cursor; step the chain.
            chain_in_off = node_end;
            if !b.flags.contains(BufferFlags::NEXT_PRESENT) {
                break;
            }
            if b.next_buffer == 0 {
                tracing::error!(node = bi, "chain has NEXT_PRESENT but no next buffer");
                break;
            }
            bi = b.next_buffer;
            continue;
        }

        let node_off = (cursor - chain_in_off) as usize;
        let n = (dst.len() - copied as usize).min((node_end - cursor) as usize);
        dst[copied as usize..][..n].copy_from_slice(&b.current_data()[node_off..node_off + n]);
        copied += n as u32;
    }

    copied
}

/// Producer-side handle: in-order and offset enqueues, plus raw byte
/// enqueue for FIFOs that do not carry descriptors.
pub struct FifoProducer {
    ring: Ring,
    ooo: OooList,
    seq: u32,
}

impl FifoProducer {
    /// Wrap a formatted control block.
    ///
    /// # Safety
    /// `shr` must point at a control block created by
    /// [`FifoShared::create_in`], mapped in this process, and no other
    /// producer handle may exist for it.
    pub unsafe fn from_raw(shr: NonNull<FifoShared>) -> Self {
        Self {
            ring: unsafe { Ring::from_raw(shr) },
            ooo: OooList::default(),
            seq: 0,
        }
    }

    /// The shared control block.
    pub fn shared(&self) -> &FifoShared {
        self.ring.shared()
    }

    fn next_seq(&mut self) -> u32 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Payload bytes currently free, net of staged out-of-order bytes.
    pub fn free_count(&self) -> u32 {
        let shr = self.shared();
        let (head2, tail2) = shr.load_payload_prod();
        (shr.capacity() - cursize(head2, tail2)).saturating_sub(self.ooo.staged_bytes())
    }

    /// Enqueue the chain rooted at `bi` in order.
    ///
    /// On success returns the payload bytes committed by this call -
    /// at least the chain's length, more when staged out-of-order
    /// segments became adjacent and were folded into the contiguous
    /// tail. `Full` is returned, with nothing changed, when free space
    /// is short.
    pub fn enqueue_buffer(&mut self, pool: &BufferPool, bi: u32) -> Result<u32, FifoError> {
        let len = pool.chain_len(bi);
        if len == 0 {
            return Ok(0);
        }

        let capacity = self.shared().capacity();
        let (head2, tail2) = self.shared().load_payload_prod();
        let free = (capacity - cursize(head2, tail2)).saturating_sub(self.ooo.staged_bytes());
        if free < len {
            return Err(FifoError::Full);
        }

        let seq = self.next_seq();
        let ring = self.ring;
        let mut tail = tail2;

        // A segment staged at exactly the current tail (offset 0)
        // commits ahead of this chain.
        let pre = self.ooo.try_collect(capacity, &mut tail, |seg| {
            ring.enqueue_bytes(&seg.to_desc().to_bytes()).is_ok()
        });

        let desc = BufferDesc {
            buffer_index: bi,
            start: tail,
            length: len,
            debug: seq,
        };
        if ring.enqueue_bytes(&desc.to_bytes()).is_err() {
            // The descriptor ring itself is full. Anything collected
            // above is already on the ring and must still be published.
            if pre > 0 {
                self.shared().store_tail2(tail);
            }
            return Err(FifoError::Full);
        }
        tail = tail.wrapping_add(len);
        tracing::trace!(bi, start = desc.start, len, "enqueued chain");

        let post = self.ooo.try_collect(capacity, &mut tail, |seg| {
            ring.enqueue_bytes(&seg.to_desc().to_bytes()).is_ok()
        });

        self.shared().store_tail2(tail);
        Ok(pre + len + post)
    }

    /// Stage the chain rooted at `bi` for a position `offset` bytes
    /// ahead of the current tail. The producer index does not move;
    /// commitment happens when in-order enqueues make the staged
    /// position adjacent.
    pub fn enqueue_buffer_at(
        &mut self,
        pool: &BufferPool,
        offset: u32,
        bi: u32,
    ) -> Result<(), FifoError> {
        let len = pool.chain_len(bi);
        let shr = self.shared();
        let (head2, tail2) = shr.load_payload_prod();
        let free = (shr.capacity() - cursize(head2, tail2)).saturating_sub(self.ooo.staged_bytes());
        if len + offset > free {
            return Err(FifoError::Full);
        }

        let seq = self.next_seq();
        self.ooo.add(tail2, offset, len, bi, seq);
        Ok(())
    }

    /// Whether out-of-order segments are pending.
    pub fn has_staged(&self) -> bool {
        !self.ooo.is_empty()
    }

    /// Raw byte enqueue for FIFOs without buffer descriptors.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), FifoError> {
        debug_assert!(!self.shared().carries_buffers());
        self.ring.enqueue_bytes(bytes)
    }
}

/// Consumer-side handle: streaming dequeue/peek/drop over descriptor
/// chains, with the cache anchoring the chain currently being drained.
pub struct FifoConsumer {
    ring: Ring,
    /// Root index of the chain being drained; 0 when none.
    cache_buffer: u32,
    /// Bytes of the cached chain already consumed.
    cache_pos: u32,
    /// Total bytes of the cached chain.
    cache_length: u32,
    /// Fully-consumed chain roots awaiting return to the pool.
    free_buffers: Vec<u32>,
}

impl FifoConsumer {
    /// Wrap a formatted control block.
    ///
    /// # Safety
    /// Same contract as [`FifoProducer::from_raw`], for the consumer
    /// role.
    pub unsafe fn from_raw(shr: NonNull<FifoShared>) -> Self {
        Self {
            ring: unsafe { Ring::from_raw(shr) },
            cache_buffer: 0,
            cache_pos: 0,
            cache_length: 0,
            free_buffers: Vec::new(),
        }
    }

    /// The shared control block.
    pub fn shared(&self) -> &FifoShared {
        self.ring.shared()
    }

    fn cache_remaining(&self) -> u32 {
        if self.cache_buffer == 0 {
            0
        } else {
            self.cache_length - self.cache_pos
        }
    }

    /// Pull the next descriptor off the ring and install its chain as
    /// the cache, retiring the previous cache chain to `free_buffers`.
    fn install_next_chain(&mut self, pool: &BufferPool) -> Result<(), FifoError> {
        let mut raw = [0u8; BUFFER_DESC_SIZE];
        self.ring.dequeue_bytes(&mut raw)?;
        let desc = BufferDesc::from_bytes(&raw);

        // The authoritative bytes-consumed counter: everything up to the
        // end of this chain is now ours, whatever the copy-out pace.
        self.shared()
            .store_head2(desc.start.wrapping_add(desc.length));

        if self.cache_buffer != 0 {
            self.free_buffers.push(self.cache_buffer);
        }

        self.cache_buffer = desc.buffer_index;
        self.cache_pos = 0;
        self.cache_length = pool.chain_len(desc.buffer_index);

        if self.cache_length != desc.length {
            // Producer/consumer contract violation or pool corruption;
            // diagnosed, then the pool-observed length wins.
            tracing::error!(
                buffer_index = desc.buffer_index,
                start = desc.start,
                descriptor_length = desc.length,
                debug = desc.debug,
                observed_length = self.cache_length,
                "dequeued descriptor length does not match chain length"
            );
        }
        Ok(())
    }

    /// Copy up to `dst.len()` payload bytes into `dst`, streaming
    /// across descriptor chains. Shorter chains than requested clamp;
    /// an empty FIFO (including an empty cache) returns `Empty`.
    pub fn dequeue_buffer(&mut self, pool: &BufferPool, dst: &mut [u8]) -> Result<usize, FifoError> {
        let shr = self.shared();
        let (head2, tail2) = shr.load_payload_cons();
        let avail = cursize(head2, tail2) + self.cache_remaining();
        if avail == 0 {
            return Err(FifoError::Empty);
        }
        let want = (dst.len() as u32).min(avail);

        let mut to_copy = 0u32;
        while to_copy < want {
            if self.cache_buffer == 0 || self.cache_length <= self.cache_pos {
                if self.install_next_chain(pool).is_err() {
                    break;
                }
            }

            let n = (want - to_copy).min(self.cache_length - self.cache_pos);
            let copied = copy_from_chain(
                pool,
                self.cache_buffer,
                self.cache_pos,
                &mut dst[to_copy as usize..][..n as usize],
            );
            if copied == 0 {
                break;
            }
            to_copy += copied;
            self.cache_pos += copied;
            if copied < n {
                break;
            }
        }

        Ok(to_copy as usize)
    }

    /// Read payload bytes starting `offset` bytes past the current read
    /// position, without consuming anything: neither the ring nor the
    /// cache moves.
    pub fn peek_buffer(
        &self,
        pool: &BufferPool,
        offset: u32,
        dst: &mut [u8],
    ) -> Result<usize, FifoError> {
        let shr = self.shared();
        let (head2, tail2) = shr.load_payload_cons();
        let avail = cursize(head2, tail2) + self.cache_remaining();
        if offset >= avail {
            return Err(FifoError::Empty);
        }
        let want = (dst.len() as u32).min(avail - offset);

        // Mirror the cache into locals; `head_offset` walks descriptors
        // on the ring non-destructively.
        let mut cache_b = self.cache_buffer;
        let mut cache_pos = self.cache_pos;
        let mut cache_len = self.cache_length;
        let mut head_offset = 0u32;
        let mut skip = offset;
        let mut to_copy = 0u32;

        while to_copy < want {
            if cache_b == 0 || cache_pos >= cache_len {
                let mut raw = [0u8; BUFFER_DESC_SIZE];
                if self.ring.peek_bytes(head_offset, &mut raw).is_err() {
                    break;
                }
                head_offset += BUFFER_DESC_SIZE as u32;
                let desc = BufferDesc::from_bytes(&raw);
                cache_b = desc.buffer_index;
                cache_pos = 0;
                cache_len = pool.chain_len(desc.buffer_index);
            }

            let remaining_here = cache_len - cache_pos;
            if skip >= remaining_here {
                // Whole remainder of this chain precedes the offset.
                skip -= remaining_here;
                cache_pos = cache_len;
                continue;
            }
            cache_pos += skip;
            skip = 0;

            let n = (want - to_copy).min(cache_len - cache_pos);
            let copied = copy_from_chain(
                pool,
                cache_b,
                cache_pos,
                &mut dst[to_copy as usize..][..n as usize],
            );
            if copied == 0 {
                break;
            }
            to_copy += copied;
            cache_pos += copied;
            if copied < n {
                break;
            }
        }

        Ok(to_copy as usize)
    }

    /// Discard up to `len` payload bytes. Descriptor and cache
    /// advancement mirror [`FifoConsumer::dequeue_buffer`], including
    /// `free_buffers` accounting; no bytes are copied.
    pub fn dequeue_drop(&mut self, pool: &BufferPool, len: u32) -> Result<u32, FifoError> {
        let shr = self.shared();
        let (head2, tail2) = shr.load_payload_cons();
        let avail = cursize(head2, tail2) + self.cache_remaining();
        if avail == 0 {
            return Err(FifoError::Empty);
        }

        let total = len.min(avail);
        tracing::trace!(total, "dropping payload bytes");

        let mut to_drop = 0u32;
        while to_drop < total {
            if self.cache_buffer == 0 || self.cache_pos >= self.cache_length {
                if self.install_next_chain(pool).is_err() {
                    break;
                }
            }
            let n = (total - to_drop).min(self.cache_length - self.cache_pos);
            to_drop += n;
            self.cache_pos += n;
        }

        Ok(total)
    }

    /// Bytes available to dequeue. For descriptor FIFOs this counts
    /// undequeued descriptors plus the unread remainder of the cached
    /// chain; for raw FIFOs it is the byte-stream cursize.
    pub fn max_dequeue(&self) -> u32 {
        let shr = self.shared();
        if shr.carries_buffers() {
            let (head2, tail2) = shr.load_payload_cons();
            cursize(head2, tail2) + self.cache_remaining()
        } else {
            let (head, tail) = shr.load_bytes_cons();
            cursize(head, tail)
        }
    }

    /// Whether nothing is available, in either mode.
    pub fn is_empty(&self) -> bool {
        self.max_dequeue() == 0
    }

    /// Chain roots fully consumed and awaiting return to the pool.
    pub fn free_buffers(&self) -> &[u32] {
        &self.free_buffers
    }

    /// Hand the consumed chain roots to the caller for
    /// [`BufferPool::free_indices`].
    pub fn take_free_buffers(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.free_buffers)
    }

    /// Raw byte dequeue for FIFOs without buffer descriptors.
    pub fn dequeue(&mut self, dst: &mut [u8]) -> Result<(), FifoError> {
        debug_assert!(!self.shared().carries_buffers());
        self.ring.dequeue_bytes(dst)
    }

    /// Raw byte peek for FIFOs without buffer descriptors.
    pub fn peek(&self, offset: u32, dst: &mut [u8]) -> Result<(), FifoError> {
        debug_assert!(!self.shared().carries_buffers());
        self.ring.peek_bytes(offset, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{map_anonymous, unmap};
    use std::ptr::NonNull;

    struct Fixture {
        base: NonNull<u8>,
        map_size: usize,
        pool: BufferPool,
        prod: FifoProducer,
        cons: FifoConsumer,
    }

    impl Fixture {
        fn new(capacity: u32) -> Self {
            let map_size = 256 * 1024;
            let base = map_anonymous(map_size).unwrap();
            let heap = SharedHeap::create(base, map_size).unwrap();
            let (prod, cons) = create_pair(&heap, capacity, true).unwrap();
            Self {
                base,
                map_size,
                pool: BufferPool::new(64, 2048),
                prod,
                cons,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unmap(self.base, self.map_size);
        }
    }

    #[test]
    fn test_single_chain_round_trip() {
        let mut fx = Fixture::new(4096);
        let payload_a = vec![0x11u8; 100];
        let payload_b = vec![0x22u8; 50];
        let bi = fx
            .pool
            .alloc_chain(&[&payload_a, &payload_b])
            .unwrap();

        assert_eq!(fx.prod.enqueue_buffer(&fx.pool, bi), Ok(150));
        assert_eq!(fx.cons.max_dequeue(), 150);

        let mut dst = vec![0u8; 150];
        assert_eq!(fx.cons.dequeue_buffer(&fx.pool, &mut dst), Ok(150));
        assert_eq!(&dst[..100], payload_a.as_slice());
        assert_eq!(&dst[100..], payload_b.as_slice());

        // Fully drained but still anchored as the cache.
        assert!(fx.cons.free_buffers().is_empty());
        assert!(fx.cons.is_empty());
    }

    #[test]
    fn test_full_boundary_is_exact() {
        let mut fx = Fixture::new(256);

        let exact = fx.pool.alloc_chain(&[&[9u8; 256]]).unwrap();
        assert_eq!(fx.prod.enqueue_buffer(&fx.pool, exact), Ok(256));

        let one = fx.pool.alloc_chain(&[&[1u8; 1]]).unwrap();
        assert_eq!(fx.prod.enqueue_buffer(&fx.pool, one), Err(FifoError::Full));
        // Ring state unchanged by the failure.
        assert_eq!(fx.cons.max_dequeue(), 256);
    }

    #[test]
    fn test_dequeue_clamps_to_available() {
        let mut fx = Fixture::new(4096);
        let bi = fx.pool.alloc_chain(&[&[5u8; 40]]).unwrap();
        fx.prod.enqueue_buffer(&fx.pool, bi).unwrap();

        let mut dst = vec![0u8; 100];
        assert_eq!(fx.cons.dequeue_buffer(&fx.pool, &mut dst), Ok(40));
    }

    #[test]
    fn test_empty_fifo() {
        let mut fx = Fixture::new(4096);
        let mut dst = [0u8; 8];
        assert_eq!(
            fx.cons.dequeue_buffer(&fx.pool, &mut dst),
            Err(FifoError::Empty)
        );
        assert!(fx.cons.is_empty());
    }

    #[test]
    fn test_offset_zero_stage_commits_on_next_enqueue() {
        let mut fx = Fixture::new(4096);

        let staged = fx.pool.alloc_chain(&[&[7u8; 30]]).unwrap();
        fx.prod.enqueue_buffer_at(&fx.pool, 0, staged).unwrap();
        assert!(fx.prod.has_staged());
        // Staging publishes nothing.
        assert_eq!(fx.cons.max_dequeue(), 0);

        let inorder = fx.pool.alloc_chain(&[&[8u8; 20]]).unwrap();
        let committed = fx.prod.enqueue_buffer(&fx.pool, inorder).unwrap();
        assert_eq!(committed, 50);
        assert!(!fx.prod.has_staged());

        // The staged chain comes out first: it owns the earlier stream
        // position.
        let mut dst = vec![0u8; 50];
        assert_eq!(fx.cons.dequeue_buffer(&fx.pool, &mut dst), Ok(50));
        assert_eq!(&dst[..30], &[7u8; 30]);
        assert_eq!(&dst[30..], &[8u8; 20]);
    }

    #[test]
    fn test_staged_bytes_count_against_free_space() {
        let mut fx = Fixture::new(256);

        let staged = fx.pool.alloc_chain(&[&[1u8; 200]]).unwrap();
        fx.prod.enqueue_buffer_at(&fx.pool, 56, staged).unwrap();
        assert_eq!(fx.prod.free_count(), 56);

        let too_big = fx.pool.alloc_chain(&[&[2u8; 100]]).unwrap();
        assert_eq!(
            fx.prod.enqueue_buffer(&fx.pool, too_big),
            Err(FifoError::Full)
        );
    }
}

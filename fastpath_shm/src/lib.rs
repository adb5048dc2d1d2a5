//! # Fastpath Shared Memory
//!
//! The cross-process communication substrate of the fastpath dataplane:
//! named memory segments mapped into two cooperating processes at the
//! same virtual address, and single-producer/single-consumer FIFOs that
//! carry references to externally-owned buffer chains across them.
//!
//! ## Segments
//!
//! A segment is created by one process (the server role), which maps it,
//! formats a page-zero [`SharedHeader`](header::SharedHeader) and an
//! embedded [`SharedHeap`](heap::SharedHeap), and publishes readiness.
//! The attaching process probes the header through a one-page mapping,
//! learns the creator's map address, and re-maps the whole segment there
//! with fixed placement - after which every pointer written by either
//! side is valid in both. Three backings exist behind one handle:
//!
//! - **Shm** - a POSIX shared-memory object under `/dev/shm`, found by
//!   name.
//! - **Memfd** - an anonymous fd the creator hands to the attacher over
//!   an out-of-band channel.
//! - **Private** - a process-local heap with no cross-process anchor;
//!   only the server role exists.
//!
//! ## Buffer-descriptor FIFOs
//!
//! A [`FifoProducer`]/[`FifoConsumer`] pair shares a ring inside a
//! segment heap. Each enqueue writes a 16-byte descriptor naming a
//! buffer chain in a pool; the consumer streams payload bytes out across
//! chains, anchoring the chain currently being drained in its cache and
//! returning fully-consumed chains through
//! [`FifoConsumer::take_free_buffers`]. Free space during enqueue and
//! current size during dequeue only ever grow, which is the invariant
//! that lets both sides run lock-free.
//!
//! ## Example
//!
//! ```rust
//! use fastpath_common::SegmentType;
//! use fastpath_shm::{BufferPool, Segment, SegmentConfig, fifo};
//!
//! # fn main() -> fastpath_shm::ShmResult<()> {
//! let seg = Segment::create(
//!     SegmentConfig::new("example_seg", 1 << 20),
//!     SegmentType::Private,
//! )?;
//! let heap = seg.heap()?;
//! let (mut producer, mut consumer) = fifo::create_pair(&heap, 64 * 1024, true)?;
//! seg.publish_ready();
//!
//! let mut pool = BufferPool::new(256, 2048);
//! let chain = pool.alloc_chain(&[b"hello ", b"chains"]).unwrap();
//! producer.enqueue_buffer(&pool, chain).unwrap();
//!
//! let mut out = [0u8; 12];
//! consumer.dequeue_buffer(&pool, &mut out).unwrap();
//! assert_eq!(&out, b"hello chains");
//! # seg.destroy();
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency contract
//!
//! Strictly one producer and one consumer per FIFO, each in its own
//! process (or thread). The producer publishes `tail2` with release
//! ordering after descriptor bytes are visible; the consumer publishes
//! `head2` with release ordering after installing a chain. No locks, no
//! blocking: `Full`/`Empty` are ordinary values and the caller decides
//! when to retry.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod fifo;
pub mod header;
pub mod heap;
pub mod platform;
pub mod segment;

pub use buffer::{Buffer, BufferFlags, BufferPool};
pub use error::{FifoError, ShmError, ShmResult};
pub use fifo::{FifoConsumer, FifoProducer};
pub use header::SharedHeader;
pub use heap::SharedHeap;
pub use segment::{Segment, SegmentConfig};

/// Initialize tracing for dataplane logging.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

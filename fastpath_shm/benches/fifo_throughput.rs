//! Buffer-descriptor FIFO throughput benchmarks

use criterion::{Criterion, criterion_group, criterion_main};
use fastpath_common::SegmentType;
use fastpath_shm::{BufferPool, Segment, SegmentConfig, fifo};
use std::hint::black_box;

/// Benchmark enqueue/dequeue round trips for different chain shapes
fn bench_chain_roundtrip(c: &mut Criterion) {
    let seg = Segment::create(
        SegmentConfig::new("bench_fifo", 8 << 20),
        SegmentType::Private,
    )
    .unwrap();
    let heap = seg.heap().unwrap();
    let (mut prod, mut cons) = fifo::create_pair(&heap, 1 << 20, true).unwrap();
    seg.publish_ready();

    let mut pool = BufferPool::new(64, 2048);
    let single = pool.alloc_chain(&[&[0xAAu8; 256]]).unwrap();
    let chained = pool
        .alloc_chain(&[&[0xAAu8; 1500], &[0xBBu8; 1500], &[0xCCu8; 1500]])
        .unwrap();

    let mut dst = vec![0u8; 4500];

    c.bench_function("roundtrip_single_node_256", |b| {
        b.iter(|| {
            black_box(prod.enqueue_buffer(&pool, single).unwrap());
            black_box(cons.dequeue_buffer(&pool, &mut dst[..256]).unwrap());
            cons.take_free_buffers();
        });
    });

    c.bench_function("roundtrip_three_node_4500", |b| {
        b.iter(|| {
            black_box(prod.enqueue_buffer(&pool, chained).unwrap());
            black_box(cons.dequeue_buffer(&pool, &mut dst).unwrap());
            cons.take_free_buffers();
        });
    });

    c.bench_function("roundtrip_partial_reads_4500", |b| {
        b.iter(|| {
            black_box(prod.enqueue_buffer(&pool, chained).unwrap());
            for chunk in dst.chunks_mut(512) {
                black_box(cons.dequeue_buffer(&pool, chunk).unwrap());
            }
            cons.take_free_buffers();
        });
    });
}

/// Benchmark the availability queries the consumer polls with
fn bench_queries(c: &mut Criterion) {
    let seg = Segment::create(
        SegmentConfig::new("bench_fifo_q", 4 << 20),
        SegmentType::Private,
    )
    .unwrap();
    let heap = seg.heap().unwrap();
    let (mut prod, cons) = fifo::create_pair(&heap, 1 << 16, true).unwrap();
    seg.publish_ready();

    let mut pool = BufferPool::new(8, 2048);
    let bi = pool.alloc_chain(&[&[1u8; 128]]).unwrap();
    prod.enqueue_buffer(&pool, bi).unwrap();

    c.bench_function("max_dequeue", |b| {
        b.iter(|| black_box(cons.max_dequeue()));
    });

    c.bench_function("is_empty", |b| {
        b.iter(|| black_box(cons.is_empty()));
    });
}

criterion_group!(benches, bench_chain_roundtrip, bench_queries);
criterion_main!(benches);

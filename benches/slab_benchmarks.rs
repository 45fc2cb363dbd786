//! Slab allocator benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slab_cache::{AllocFlags, HeapPages, SlabAllocator};

fn bench_small_alloc_free(c: &mut Criterion) {
    let mut allocator = SlabAllocator::new(HeapPages::new());
    let cache = allocator.create("bench-small", 64, 0);
    c.bench_function("small_alloc_free", |b| {
        b.iter(|| unsafe {
            let buf = allocator.alloc(cache, AllocFlags::SLEEP);
            allocator.free(cache, black_box(buf));
        })
    });
    unsafe { allocator.destroy(cache) };
}

fn bench_large_alloc_free(c: &mut Criterion) {
    let mut allocator = SlabAllocator::new(HeapPages::new());
    let cache = allocator.create("bench-large", 1024, 0);
    c.bench_function("large_alloc_free", |b| {
        b.iter(|| unsafe {
            let buf = allocator.alloc(cache, AllocFlags::SLEEP);
            allocator.free(cache, black_box(buf));
        })
    });
    unsafe { allocator.destroy(cache) };
}

fn bench_slab_churn(c: &mut Criterion) {
    let mut allocator = SlabAllocator::new(HeapPages::new());
    let cache = allocator.create("bench-churn", 128, 0);
    let per_slab = unsafe { (*cache).stats().total_buffers };
    c.bench_function("slab_churn", |b| {
        b.iter(|| unsafe {
            // overflow into a second slab, then drain so it reaps
            let mut buffers = Vec::with_capacity(per_slab + 1);
            for _ in 0..per_slab + 1 {
                buffers.push(allocator.alloc(cache, AllocFlags::SLEEP));
            }
            for buf in buffers {
                allocator.free(cache, buf);
            }
        })
    });
    unsafe { allocator.destroy(cache) };
}

fn bench_cache_lifecycle(c: &mut Criterion) {
    let mut allocator = SlabAllocator::new(HeapPages::new());
    c.bench_function("cache_lifecycle", |b| {
        b.iter(|| unsafe {
            let cache = allocator.create("bench-lifecycle", 96, 0);
            allocator.destroy(black_box(cache));
        })
    });
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_large_alloc_free,
    bench_slab_churn,
    bench_cache_lifecycle
);

criterion_main!(benches);

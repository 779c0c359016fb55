// Buffer Pool Performance Benchmarks
// Hot-path pin/unpin, allocator throughput, and eviction thrash.

use basalt::buffer::{BufferManager, BufferManagerBuilder, PageSizeType, BASE_PAGE_SIZE};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

fn create_manager(dram_bytes: usize) -> (Arc<BufferManager>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let manager = BufferManagerBuilder::new()
        .dram_pool_size(dram_bytes)
        .ssd_path(temp_dir.path().join("bench.db"))
        .pages_per_class(4096)
        .build()
        .unwrap();
    (manager, temp_dir)
}

fn bench_pin_unpin_hit(c: &mut Criterion) {
    let (manager, _temp) = create_manager(16 * 1024 * 1024);
    let page_id = manager.new_page(PageSizeType::KiB4).unwrap();

    c.bench_function("pin_unpin_resident", |b| {
        b.iter(|| {
            let guard = manager.pin(black_box(page_id)).unwrap();
            black_box(guard.data()[0]);
        });
    });
}

fn bench_allocate_deallocate(c: &mut Criterion) {
    let (manager, _temp) = create_manager(16 * 1024 * 1024);

    c.bench_function("allocate_deallocate_256b", |b| {
        b.iter(|| {
            let ptr = manager.allocate(black_box(256), 8).unwrap();
            manager.deallocate(ptr, 256, 8);
        });
    });
}

fn bench_eviction_thrash(c: &mut Criterion) {
    // Pool of 8 pages cycling over 64: every pin is a miss
    let (manager, _temp) = create_manager(8 * BASE_PAGE_SIZE);
    let ids: Vec<_> = (0..64)
        .map(|_| manager.new_page(PageSizeType::KiB4).unwrap())
        .collect();
    manager.flush_all();

    let mut cursor = 0usize;
    c.bench_function("pin_unpin_thrash", |b| {
        b.iter(|| {
            let guard = manager.pin(ids[cursor % ids.len()]).unwrap();
            black_box(guard.data()[0]);
            cursor += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_pin_unpin_hit,
    bench_allocate_deallocate,
    bench_eviction_thrash
);
criterion_main!(benches);

//! Hot-path benchmarks: ring sub-allocation, pool recycling and upload routing.

use std::hint::black_box;
use std::sync::Arc;

use cadence::cadence_headless::HeadlessDevice;
use cadence::{EngineSettings, Poolable, ResourceFactory, ResourcePool, RingAllocator, StagingRouter};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn ring_benchmark(c: &mut Criterion) {
    let device = Arc::new(HeadlessDevice::manual());
    let mut group = c.benchmark_group("ring");

    for size in [256_u64, 4096, 65536] {
        let heap = device.create_upload_heap(16 * 1024 * 1024).unwrap();
        let ring = RingAllocator::new(heap).unwrap();
        let mut fence = 0;

        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::new("allocate_retire", size), &size, |b, &size| {
            b.iter(|| {
                fence += 1;
                let region = ring.allocate(black_box(size), 256, fence).unwrap();
                black_box(region.offset());
                // Three frames in flight.
                ring.retire(fence.saturating_sub(3));
            });
        });
    }
    group.finish();
}

struct Allocator(u64);

impl Poolable for Allocator {
    fn reset(&mut self) -> cadence::Result<()> {
        Ok(())
    }

    fn native_handle(&self) -> u64 {
        self.0
    }
}

fn pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    group.bench_function("acquire_release", |b| {
        let pool = ResourcePool::new("bench allocators", 64);
        let mut fence = 0_u64;
        let mut handles = 0;
        b.iter(|| {
            fence += 1;
            let completed = fence.saturating_sub(3);
            let item = pool
                .acquire(&completed, |_| true, || {
                    handles += 1;
                    Ok(Allocator(handles))
                })
                .unwrap();
            black_box(item.native_handle());
            pool.release(item, fence).unwrap();
        });
    });

    group.finish();
}

fn router_benchmark(c: &mut Criterion) {
    let device = Arc::new(HeadlessDevice::manual());
    let settings = EngineSettings { ring_buffer_size: 16 * 1024 * 1024, ..EngineSettings::default() }.validate();
    let router = StagingRouter::new(device, &settings).unwrap();
    let payload = vec![0x5A_u8; 1024];

    let mut group = c.benchmark_group("staging");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    let mut fence = 0_u64;
    group.bench_function("upload_1k", |b| {
        b.iter(|| {
            fence += 1;
            let completed = fence.saturating_sub(3);
            let mut upload = router.allocate_upload(1024, 256, fence, &completed).unwrap();
            upload.write(0, black_box(&payload)).unwrap();
            router.free(upload, fence).unwrap();
            router.retire(completed);
        });
    });
    group.finish();
}

criterion_group!(benches, ring_benchmark, pool_benchmark, router_benchmark);
criterion_main!(benches);

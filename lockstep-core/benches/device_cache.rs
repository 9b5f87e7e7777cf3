use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use lockstep_core::device::{DeviceCache, JointState};
use lockstep_core::Device;

fn joints(count: usize, offset: usize) -> Vec<Device> {
    (0..count)
        .map(|i| {
            Device::new(
                format!("joint_{:04}", (i * 7 + offset) % count),
                "physics",
                JointState {
                    position: i as f64,
                    velocity: 0.0,
                    effort: 0.0,
                },
            )
        })
        .collect()
}

fn bench_merge_into_empty(c: &mut Criterion) {
    c.bench_function("device_cache_merge_empty_1000", |b| {
        b.iter_batched(
            || joints(1000, 0),
            |devices| {
                let mut cache = DeviceCache::new();
                cache.merge(devices);
                cache
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_merge_overlapping(c: &mut Criterion) {
    let mut base = DeviceCache::new();
    base.merge(joints(1000, 0));

    c.bench_function("device_cache_merge_overlap_1000", |b| {
        b.iter_batched(
            || (base.clone(), joints(500, 3)),
            |(mut cache, devices)| {
                cache.merge(devices);
                cache
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_merge_into_empty, bench_merge_overlapping);
criterion_main!(benches);

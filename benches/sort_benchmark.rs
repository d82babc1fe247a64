//! Criterion benchmarks for the sorting pipeline.
//!
//! The GPU path is benchmarked through the software device, so the
//! numbers measure the host orchestration plus the kernel semantics, not
//! real device throughput; the host standard sort is the baseline.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpu_radix_sort::{ComputeDevice, Settings, SoftwareDevice, Sorter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn generate_keys(size: usize) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(0);
    (0..size).map(|_| rng.gen()).collect()
}

fn bench_std_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("std sort_unstable");

    for size_exp in [10, 12, 14] {
        let size = 1usize << size_exp;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || generate_keys(size),
                |mut keys| {
                    keys.sort_unstable();
                    keys
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_radix_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix pipeline (software device)");

    for size_exp in [10, 12, 14] {
        let size = 1usize << size_exp;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let device = SoftwareDevice::new();
            let mut sorter = Sorter::new(&device, Settings::new(size as u32)).unwrap();
            let buffer = device
                .create_buffer(sorter.capacity() as usize * 4)
                .unwrap();
            let keys = generate_keys(size);

            b.iter(|| {
                device.write_buffer(buffer, bytemuck::cast_slice(&keys), 0);
                sorter.sort(black_box(buffer), size as u32).unwrap();
                let mut sorted = vec![0u32; size];
                device.read_buffer(buffer, bytemuck::cast_slice_mut(&mut sorted), 0);
                sorted
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_std_sort, bench_radix_pipeline);
criterion_main!(benches);

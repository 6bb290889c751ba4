use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use strata::Pool;

fn bench_small_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Small Roundtrip");

    group.bench_function("Box::new(u64)", |b| {
        b.iter(|| {
            black_box(Box::new(42u64));
        })
    });

    group.bench_function("Pool 64B", |b| {
        b.iter_batched(
            Pool::new,
            |pool| {
                // Alloc + free pairs hit the thread-cache fast path after
                // the first iteration.
                for _ in 0..1000 {
                    let ptr = pool.allocate(64, 0, false).unwrap();
                    black_box(ptr);
                    pool.deallocate(ptr.as_ptr());
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_mixed_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mixed Batch 1000");
    const SIZES: [usize; 8] = [16, 24, 64, 100, 256, 512, 1024, 4096];

    group.bench_function("Vec<Box<[u8]>>", |b| {
        b.iter(|| {
            let mut held = Vec::with_capacity(1000);
            for index in 0..1000 {
                held.push(vec![0u8; SIZES[index % SIZES.len()]].into_boxed_slice());
            }
            black_box(held);
        })
    });

    group.bench_function("Pool mixed", |b| {
        b.iter_batched(
            Pool::new,
            |pool| {
                let mut held = Vec::with_capacity(1000);
                for index in 0..1000 {
                    held.push(pool.allocate(SIZES[index % SIZES.len()], 0, false).unwrap());
                }
                for ptr in held {
                    pool.deallocate(ptr.as_ptr());
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_aligned(c: &mut Criterion) {
    let mut group = c.benchmark_group("Page-Aligned 1KiB");

    group.bench_function("Pool align=4096", |b| {
        b.iter_batched(
            Pool::new,
            |pool| {
                for _ in 0..100 {
                    let ptr = pool.allocate(1024, 4096, false).unwrap();
                    black_box(ptr);
                    pool.deallocate(ptr.as_ptr());
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_small_roundtrip,
    bench_mixed_batch,
    bench_aligned
);
criterion_main!(benches);

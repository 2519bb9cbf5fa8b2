//! Benchmarks for cache reads, invalidation chains and flush batching.
//!
//! Run with: cargo bench -p weft-cache

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use weft_cache::{Cache, CacheError, OwnerId, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stored(previous: Option<u64>) -> Result<u64> {
    previous.ok_or_else(|| CacheError::compute("unset"))
}

/// Build a chain `link0 <- link1 <- ... <- link{len-1}` over a single input.
/// Returns the getter for the last link.
fn chain(cache: &Cache, owner: OwnerId, len: u64) -> impl Fn(Option<u64>) -> Result<u64> + Clone + 'static {
    fn link(cache: &Cache, owner: OwnerId, n: u64) -> Result<u64> {
        if n == 0 {
            return cache.get(owner, "input", stored);
        }
        let c = cache.clone();
        Ok(cache.get(owner, n - 1, move |_: Option<u64>| link(&c, owner, n - 1))? + 1)
    }
    let cache = cache.clone();
    move |_| link(&cache, owner, len)
}

// ---------------------------------------------------------------------------
// 1. Cache hits on a dependency chain
// ---------------------------------------------------------------------------

fn bench_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/hit");

    for depth in [1u64, 16, 128] {
        let cache = Cache::new();
        let owner = cache.owner();
        let id = owner.id();
        cache.set(id, "input", |v, _| Ok(v), 1u64).unwrap();
        let top = chain(&cache, id, depth);
        cache.get(id, "top", top.clone()).unwrap();

        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| black_box(cache.get(id, "top", top.clone()).unwrap()))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Write at the bottom, read at the top
// ---------------------------------------------------------------------------

fn bench_write_then_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/write_then_read");

    for depth in [1u64, 16, 128] {
        let cache = Cache::new();
        let owner = cache.owner();
        let id = owner.id();
        cache.set(id, "input", |v, _| Ok(v), 0u64).unwrap();
        let top = chain(&cache, id, depth);
        cache.get(id, "top", top.clone()).unwrap();

        group.throughput(Throughput::Elements(depth));
        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                next = next.wrapping_add(1);
                cache.set(id, "input", |v, _| Ok(v), next).unwrap();
                black_box(cache.get(id, "top", top.clone()).unwrap())
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Fan-out: many observers on one input, one flush per write
// ---------------------------------------------------------------------------

fn bench_flush_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/flush_fan_out");

    for observers in [10u64, 100, 1_000] {
        let cache = Cache::new();
        let owner = cache.owner();
        let id = owner.id();
        cache.set(id, "input", |v, _| Ok(v), 0u64).unwrap();

        let subs: Vec<_> = (0..observers)
            .map(|i| {
                let c = cache.clone();
                cache
                    .observe(
                        id,
                        i,
                        move |_: Option<u64>| Ok(c.get(id, "input", stored)? + i),
                        |v: &u64, _| {
                            black_box(*v);
                            Ok(())
                        },
                    )
                    .unwrap()
            })
            .collect();

        group.throughput(Throughput::Elements(observers));
        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(observers), &observers, |b, _| {
            b.iter(|| {
                next = next.wrapping_add(1);
                cache.set(id, "input", |v, _| Ok(v), next).unwrap();
                black_box(cache.flush())
            })
        });
        drop(subs);
    }
    group.finish();
}

criterion_group!(benches, bench_hit, bench_write_then_read, bench_flush_fan_out);
criterion_main!(benches);

//! Performance benchmarks for id and subnet pools

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resource_manager::events::NoopObserver;
use resource_manager::{
    Consumer, IdPool, IdPoolConfig, IdRequest, IdStrategy, IpAddressPool, Range, ResourceManager,
    Subnet,
};
use std::sync::Arc;

fn id_pool(size: u64) -> IdPool {
    IdPool::new("bench", Range::new(1, size), Arc::new(NoopObserver))
}

/// Benchmark draining an id pool with each strategy
fn bench_id_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_allocation");
    let consumer = Consumer::default();

    for size in [1_000u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        for strategy in [IdStrategy::FirstFree, IdStrategy::RoundRobin] {
            let label = format!("{:?}", strategy);
            group.bench_with_input(BenchmarkId::new(label, size), size, |b, &size| {
                b.iter(|| {
                    let mut pool = id_pool(size);
                    let mut count = 0u64;
                    while pool.allocate_with(strategy, &consumer, "k").is_ok() {
                        count += 1;
                    }
                    black_box(count)
                });
            });
        }
    }

    group.finish();
}

/// Benchmark release into a fragmented pool
fn bench_id_release(c: &mut Criterion) {
    let consumer = Consumer::default();

    c.bench_function("id_release_fragmented", |b| {
        b.iter_batched(
            || {
                let mut pool = id_pool(10_000);
                for v in (1..=10_000).step_by(2) {
                    let _ = pool.allocate_specific(v, &consumer, "k");
                }
                pool
            },
            |mut pool| {
                for v in (1..=10_000).step_by(2) {
                    let _ = pool.release(v);
                }
                black_box(pool)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark subnet allocation and release churn
fn bench_subnet_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("subnet_churn");
    let consumer = Consumer::default();
    let base: Subnet = "10.0.0.0/16".parse().expect("valid subnet");

    for prefix in [24u8, 28, 32].iter() {
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, &prefix| {
            b.iter_batched(
                || {
                    let mut pool = IpAddressPool::new("bench", Arc::new(NoopObserver));
                    let _ = pool.add_subnet(base);
                    pool
                },
                |mut pool| {
                    let mut held = Vec::new();
                    for _ in 0..64 {
                        if let Ok(s) = pool.allocate(prefix, 128, &consumer, "k") {
                            held.push(s);
                        }
                    }
                    for s in &held {
                        let _ = pool.release(s);
                    }
                    black_box(pool)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark synchronized allocation across several pools
fn bench_sync_group(c: &mut Criterion) {
    c.bench_function("sync_group_4_pools", |b| {
        b.iter_batched(
            || {
                let manager = ResourceManager::new();
                for i in 0..4 {
                    let _ = manager.create_id_pool(&IdPoolConfig::new(
                        format!("pool-{}", i),
                        Range::new(1, 4096),
                    ));
                }
                manager
            },
            |manager| {
                for key in 0..32 {
                    for i in 0..4 {
                        let request =
                            IdRequest::new(format!("pool-{}", i), format!("key-{}", key)).synced();
                        let _ = manager.allocate_id(request);
                    }
                }
                black_box(manager)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_id_allocation,
    bench_id_release,
    bench_subnet_churn,
    bench_sync_group,
);

criterion_main!(benches);

//! Performance benchmarks for chain locking.
//!
//! These benchmarks measure the hot paths every gateway operation takes:
//! - Chain lock acquire/release at increasing depths
//! - Rollback when a deep chain hits a contended ancestor
//! - Path normalization and ancestor id derivation

use std::path::Path;
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gateway::locking::{ChainLockManager, LockKind};
use gateway::paths::normalize::{lock_ancestors, qualified_id};

fn chain_for(depth: usize) -> (String, Vec<String>) {
    let ancestors: Vec<String> = (1..=depth)
        .map(|level| {
            (1..=level)
                .map(|i| format!("/d{i}"))
                .collect::<String>()
        })
        .collect();
    let target = format!("{}/file.bin", ancestors.last().map_or("", String::as_str));
    (target, ancestors)
}

/// Benchmark uncontended acquire + release.
fn bench_chain_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_acquire");

    for depth in [1usize, 4, 16] {
        let manager = ChainLockManager::new();
        let (target, ancestors) = chain_for(depth);

        group.bench_with_input(BenchmarkId::new("read", depth), &depth, |b, _| {
            b.iter(|| {
                let guard = manager.acquire(black_box(&target), LockKind::Read, &ancestors);
                black_box(guard.is_enabled())
            });
        });

        group.bench_with_input(BenchmarkId::new("write", depth), &depth, |b, _| {
            b.iter(|| {
                let guard = manager.acquire(black_box(&target), LockKind::Write, &ancestors);
                black_box(guard.is_enabled())
            });
        });
    }

    group.finish();
}

/// Benchmark the rollback path: the deepest ancestor is write-locked.
fn bench_chain_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_rollback");

    for depth in [4usize, 16] {
        let manager = ChainLockManager::new();
        let (target, ancestors) = chain_for(depth);
        let (above, deepest) = ancestors.split_at(depth - 1);
        let _writer = manager.acquire(&deepest[0], LockKind::Write, above);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let guard = manager.acquire(black_box(&target), LockKind::Read, &ancestors);
                black_box(guard.is_enabled())
            });
        });
    }

    group.finish();
}

/// Benchmark shared readers across threads on the same chain.
fn bench_concurrent_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_readers");
    let manager = Arc::new(ChainLockManager::new());
    let (target, ancestors) = chain_for(8);
    let ancestors = Arc::new(ancestors);

    group.bench_function("4_threads_x_256", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let ancestors = Arc::clone(&ancestors);
                    let target = target.clone();
                    thread::spawn(move || {
                        let mut granted = 0;
                        for _ in 0..256 {
                            let guard = manager.acquire(&target, LockKind::Read, &ancestors);
                            granted += usize::from(guard.is_enabled());
                        }
                        granted
                    })
                })
                .collect();
            let total: usize = handles.into_iter().map(|h| h.join().unwrap_or(0)).sum();
            black_box(total)
        });
    });

    group.finish();
}

/// Benchmark id derivation for a deep path.
fn bench_ancestor_ids(c: &mut Criterion) {
    let root = Path::new("/srv/files");
    let path = Path::new("/srv/files/a/b/c/d/e/f/g/report.pdf");

    c.bench_function("lock_ancestors_depth_7", |b| {
        b.iter(|| black_box(lock_ancestors(black_box(root), black_box(path))));
    });
    c.bench_function("qualified_id", |b| {
        b.iter(|| black_box(qualified_id(black_box(path))));
    });
}

criterion_group!(
    benches,
    bench_chain_acquire,
    bench_chain_rollback,
    bench_concurrent_readers,
    bench_ancestor_ids,
);

criterion_main!(benches);

//! Mutex hot-path microbenchmarks.
//!
//! Uncontended lock/unlock per mutex type, trylock, and a two-thread
//! contended handoff.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use uthread_bench::{BenchStats, mode_label, print_env_metadata_once};
use uthread_core::pthread::{
    Mutex, MutexAttr, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE,
    PTHREAD_MUTEX_ROBUST, create, join,
};

const TAG: &str = "MUTEX_BENCH";

fn mutex_of(kind: i32, robust: bool) -> Mutex {
    let mut attr = MutexAttr::new();
    assert_eq!(attr.set_type(kind), 0);
    if robust {
        assert_eq!(attr.set_robust(PTHREAD_MUTEX_ROBUST), 0);
    }
    Mutex::with_attr(&attr)
}

fn bench_lock_unlock(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let variants = [
        ("normal", mutex_of(PTHREAD_MUTEX_NORMAL, false)),
        ("recursive", mutex_of(PTHREAD_MUTEX_RECURSIVE, false)),
        ("errorcheck", mutex_of(PTHREAD_MUTEX_ERRORCHECK, false)),
        ("robust", mutex_of(PTHREAD_MUTEX_NORMAL, true)),
    ];

    let mut group = c.benchmark_group("mutex_hotpath");
    group.throughput(Throughput::Elements(1));
    for (label, lock) in &variants {
        for _ in 0..10_000 {
            lock.lock();
            lock.unlock();
        }
        let stats = RefCell::new(BenchStats::default());
        group.bench_function(BenchmarkId::new(format!("lock_unlock_{label}"), mode), |b| {
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    black_box(lock.lock());
                    black_box(lock.unlock());
                }
                let dur = start.elapsed().max(Duration::from_nanos(1));
                stats.borrow_mut().record(iters, dur);
                dur
            });
        });
        stats.borrow().report(TAG, mode, &format!("lock_unlock_{label}"));
    }
    group.finish();
}

fn bench_trylock(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let lock = Mutex::new();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("mutex_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("trylock", mode), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                black_box(lock.trylock());
                lock.unlock();
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "trylock");
}

/// Two threads hammering one mutex. Thread-heavy, so driven by hand rather
/// than through criterion's warmup.
fn bench_contended_pair(_c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let rounds = 20;
    let iters_per_thread: u64 = 5_000;
    let mut stats = BenchStats::default();

    for _ in 0..rounds {
        let lock = Arc::new(Mutex::new());
        let start = Instant::now();
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                create(None, move || {
                    for _ in 0..iters_per_thread {
                        lock.lock();
                        lock.unlock();
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for w in &workers {
            join(w).unwrap();
        }
        let dur = start.elapsed().max(Duration::from_nanos(1));
        stats.record(iters_per_thread * 2, dur);
    }
    stats.report(TAG, mode, "contended_pair");
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(80);
    targets = bench_lock_unlock, bench_trylock, bench_contended_pair
);
criterion_main!(benches);

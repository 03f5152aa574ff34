//! Semaphore microbenchmarks.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use uthread_bench::{BenchStats, mode_label, print_env_metadata_once};
use uthread_core::pthread::{Semaphore, create, join};

const TAG: &str = "SEM_BENCH";

fn bench_post_wait(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let sem = Semaphore::new(0, false).unwrap();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("sem_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("post_wait", mode), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                black_box(sem.post());
                black_box(sem.wait());
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "post_wait");
}

fn bench_trywait_empty(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let sem = Semaphore::new(0, false).unwrap();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("sem_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("trywait_empty", mode), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                black_box(sem.trywait());
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "trywait_empty");
}

/// A producer posting to a consumer that parks whenever it drains the
/// count.
fn bench_handoff(_c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();
    let rounds = 20;
    let units: u64 = 2_000;
    let mut stats = BenchStats::default();

    for _ in 0..rounds {
        let sem = Arc::new(Semaphore::new(0, false).unwrap());
        let consumer_sem = Arc::clone(&sem);
        let start = Instant::now();
        let consumer = create(None, move || {
            for _ in 0..units {
                consumer_sem.wait();
            }
            0
        })
        .unwrap();
        for _ in 0..units {
            sem.post();
        }
        join(&consumer).unwrap();
        let dur = start.elapsed().max(Duration::from_nanos(1));
        stats.record(units, dur);
    }
    stats.report(TAG, mode, "handoff");
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(80);
    targets = bench_post_wait, bench_trywait_empty, bench_handoff
);
criterion_main!(benches);

//! Shared sample bookkeeping for the uthread benches.
//!
//! Every bench records its `iter_custom` batches here and prints one
//! percentile summary line per benchmark, tagged with the `UTHREAD_MODE`
//! the run was started under so strict and hardened runs can be diffed.

use std::time::Duration;

#[derive(Debug, Default)]
pub struct BenchStats {
    samples_ns_per_op: Vec<f64>,
    total_iters: u64,
    total_ns: u128,
}

impl BenchStats {
    pub fn record(&mut self, iters: u64, dur: Duration) {
        let ns = dur.as_nanos();
        self.total_iters = self.total_iters.saturating_add(iters);
        self.total_ns = self.total_ns.saturating_add(ns);
        self.samples_ns_per_op.push(ns as f64 / iters.max(1) as f64);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples_ns_per_op.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples_ns_per_op.is_empty()
    }

    /// Prints `<tag> mode=.. bench=.. samples=.. p50_ns_op=..` and friends.
    pub fn report(&self, tag: &str, mode_label: &str, bench_label: &str) {
        let Some(summary) = self.summary() else {
            return;
        };
        println!(
            "{tag} mode={mode_label} bench={bench_label} samples={} p50_ns_op={:.3} p95_ns_op={:.3} p99_ns_op={:.3} mean_ns_op={:.3} throughput_ops_s={:.3}",
            summary.samples,
            summary.p50,
            summary.p95,
            summary.p99,
            summary.mean,
            summary.throughput_ops_s
        );
    }

    #[must_use]
    pub fn summary(&self) -> Option<Summary> {
        if self.samples_ns_per_op.is_empty() {
            return None;
        }
        let mut samples = self.samples_ns_per_op.clone();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let throughput_ops_s = if self.total_ns == 0 {
            0.0
        } else {
            (self.total_iters as f64) / (self.total_ns as f64 / 1e9)
        };
        Some(Summary {
            samples: samples.len(),
            p50: percentile_sorted(&samples, 0.50),
            p95: percentile_sorted(&samples, 0.95),
            p99: percentile_sorted(&samples, 0.99),
            mean: samples.iter().sum::<f64>() / samples.len() as f64,
            throughput_ops_s,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub samples: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub throughput_ops_s: f64,
}

#[must_use]
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&p));
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// The mode this run resolved to.
#[must_use]
pub fn mode_label() -> &'static str {
    uthread_core::config::mode().as_str()
}

/// Prints the raw `UTHREAD_MODE` once per bench binary.
pub fn print_env_metadata_once(tag: &str) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let mode_raw = std::env::var("UTHREAD_MODE").unwrap_or_else(|_| "<unset>".to_string());
        println!("{tag}_META uthread_mode_env={mode_raw}");
    });
}

//! Stress harness for the uthread runtime.
//!
//! Named scenarios drive the synchronization primitives from several
//! runtime threads at once and check an invariant at the end; the runner
//! times them under a chosen safety mode and the report module renders the
//! results as markdown or JSON.

pub mod report;
pub mod runner;
pub mod scenarios;

pub use report::{RunSummary, StressReport};
pub use runner::{ScenarioResult, StressRunner};
pub use scenarios::{Outcome, Scenario, ScenarioParams};

/// Scenarios flip the process-wide safety mode; tests that run them take
/// this lock so a mode switch never lands mid-scenario.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    TEST_GUARD.lock().unwrap_or_else(|p| p.into_inner())
}

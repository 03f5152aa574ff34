//! Scenario execution engine.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uthread_core::config::{self, RuntimeConfig, SafetyLevel};

use crate::scenarios::{Scenario, ScenarioParams};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub mode: String,
    pub passed: bool,
    pub ops: u64,
    pub elapsed_ns: u64,
    /// Summary on success, the broken invariant on failure.
    pub detail: String,
}

impl ScenarioResult {
    #[must_use]
    pub fn ns_per_op(&self) -> f64 {
        if self.ops == 0 {
            0.0
        } else {
            self.elapsed_ns as f64 / self.ops as f64
        }
    }
}

/// Runs scenarios under one safety mode.
pub struct StressRunner {
    /// Name of the run, carried into the report.
    pub campaign: String,
    pub mode: SafetyLevel,
    pub params: ScenarioParams,
}

impl StressRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>, mode: SafetyLevel, params: ScenarioParams) -> Self {
        Self {
            campaign: campaign.into(),
            mode,
            params,
        }
    }

    /// Switches the process to this runner's mode, keeping every other
    /// resolved knob.
    fn apply_mode(&self) {
        let cfg = RuntimeConfig {
            mode: self.mode,
            ..config::runtime_config()
        };
        config::override_for_tests(cfg);
    }

    pub fn run(&self, scenarios: &[Scenario]) -> Vec<ScenarioResult> {
        self.apply_mode();
        scenarios
            .iter()
            .map(|&scenario| self.run_one(scenario))
            .collect()
    }

    fn run_one(&self, scenario: Scenario) -> ScenarioResult {
        tracing::info!(
            campaign = %self.campaign,
            scenario = scenario.name(),
            mode = self.mode.as_str(),
            threads = self.params.threads,
            iterations = self.params.iterations,
            "scenario start"
        );
        let start = Instant::now();
        let outcome = scenario.run(&self.params);
        let elapsed_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(outcome) => ScenarioResult {
                scenario,
                mode: self.mode.as_str().to_string(),
                passed: true,
                ops: outcome.ops,
                elapsed_ns,
                detail: outcome.detail,
            },
            Err(detail) => ScenarioResult {
                scenario,
                mode: self.mode.as_str().to_string(),
                passed: false,
                ops: 0,
                elapsed_ns,
                detail,
            },
        };
        if result.passed {
            tracing::info!(
                scenario = scenario.name(),
                elapsed_ns,
                ops = result.ops,
                "scenario passed"
            );
        } else {
            tracing::error!(scenario = scenario.name(), detail = %result.detail, "scenario failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardened_runner_tags_results_and_switches_mode() {
        let _guard = crate::test_guard();
        let params = ScenarioParams {
            threads: 2,
            iterations: 20,
        };
        let runner = StressRunner::new("smoke", SafetyLevel::Hardened, params);
        let results = runner.run(&[Scenario::MutexCounter, Scenario::OnceRace]);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.passed && r.mode == "hardened"));
        assert_eq!(config::mode(), SafetyLevel::Hardened);

        let strict = StressRunner::new("smoke", SafetyLevel::Strict, params);
        let results = strict.run(&[Scenario::SemHandoff]);
        assert!(results[0].passed);
        assert_eq!(results[0].mode, "strict");
        assert_eq!(config::mode(), SafetyLevel::Strict);
    }

    #[test]
    fn ns_per_op_handles_zero_ops() {
        let r = ScenarioResult {
            scenario: Scenario::CondQueue,
            mode: "strict".into(),
            passed: false,
            ops: 0,
            elapsed_ns: 100,
            detail: String::new(),
        };
        assert_eq!(r.ns_per_op(), 0.0);
    }
}

//! Report generation for stress runs.

use serde::{Deserialize, Serialize};

use crate::runner::ScenarioResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

impl RunSummary {
    #[must_use]
    pub fn from_results(results: Vec<ScenarioResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// A stress report over one or more modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressReport {
    pub title: String,
    /// Modes exercised, e.g. `strict+hardened`.
    pub mode: String,
    pub timestamp: String,
    pub threads: usize,
    pub iterations: u64,
    pub summary: RunSummary,
}

impl StressReport {
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Mode: {}\n", self.mode));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!(
            "- Scale: {} threads x {} iterations\n",
            self.threads, self.iterations
        ));
        out.push_str(&format!("- Total: {}\n", self.summary.total));
        out.push_str(&format!("- Passed: {}\n", self.summary.passed));
        out.push_str(&format!("- Failed: {}\n\n", self.summary.failed));

        out.push_str("| Scenario | Mode | Ops | ns/op | Status | Detail |\n");
        out.push_str("|----------|------|-----|-------|--------|--------|\n");
        for r in &self.summary.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "| {} | {} | {} | {:.1} | {} | {} |\n",
                r.scenario.name(),
                r.mode,
                r.ops,
                r.ns_per_op(),
                status,
                r.detail
            ));
        }
        out
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::Scenario;

    fn result(scenario: Scenario, passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario,
            mode: "strict".into(),
            passed,
            ops: 400,
            elapsed_ns: 2_000,
            detail: if passed { "ok".into() } else { "counter 3, expected 4".into() },
        }
    }

    fn sample() -> StressReport {
        StressReport {
            title: "uthread stress".into(),
            mode: "strict".into(),
            timestamp: "t0".into(),
            threads: 4,
            iterations: 100,
            summary: RunSummary::from_results(vec![
                result(Scenario::MutexCounter, true),
                result(Scenario::BarrierRounds, false),
            ]),
        }
    }

    #[test]
    fn summary_counts_failures() {
        let report = sample();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.passed, 1);
        assert!(!report.summary.all_passed());
    }

    #[test]
    fn markdown_lists_every_scenario() {
        let md = sample().to_markdown();
        assert!(md.starts_with("# uthread stress"));
        assert!(md.contains("| mutex_counter | strict | 400 | 5.0 | PASS | ok |"));
        assert!(md.contains("| barrier_rounds | strict | 400 | 5.0 | FAIL |"));
    }

    #[test]
    fn json_round_trips() {
        let json = sample().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["failed"], 1);
        assert_eq!(value["summary"]["results"][1]["scenario"], "barrier_rounds");
        let back: StressReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary.results, sample().summary.results);
    }
}

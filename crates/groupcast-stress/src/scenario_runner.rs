/// Runs a list of scenarios back to back on one cluster, the way the
/// classic duplicate test shares its channels across cases, and reports an
/// aggregated verdict.
use std::time::Instant;

use serde::Serialize;

use crate::cluster::Cluster;
use crate::events::emit;
use crate::scenario_common::ScenarioResult;
use crate::scenarios::{self, RunSettings, Scenario};

#[derive(Serialize)]
struct RunnerSummary {
    event: &'static str,
    scenarios: Vec<ScenarioLine>,
    total_passed: usize,
    total_failed: usize,
    total_elapsed_s: f64,
    overall_status: &'static str,
}

#[derive(Serialize)]
struct ScenarioLine {
    scenario: &'static str,
    status: &'static str,
    passed: usize,
    failed: usize,
    elapsed_ms: f64,
}

impl ScenarioLine {
    fn from_outcome(scenario: Scenario, outcome: &anyhow::Result<ScenarioResult>) -> Self {
        match outcome {
            Ok(r) => Self {
                scenario: scenario.name(),
                status: if r.success() { "PASS" } else { "FAIL" },
                passed: r.passed,
                failed: r.failed,
                elapsed_ms: r.total_ms,
            },
            // A scenario that could not run counts as one failed step.
            Err(_) => Self {
                scenario: scenario.name(),
                status: "ERROR",
                passed: 0,
                failed: 1,
                elapsed_ms: 0.0,
            },
        }
    }
}

impl RunnerSummary {
    fn new(lines: Vec<ScenarioLine>, elapsed_s: f64) -> Self {
        let total_passed = lines.iter().map(|l| l.passed).sum();
        let total_failed: usize = lines.iter().map(|l| l.failed).sum();
        let all_pass = lines.iter().all(|l| l.status == "PASS");
        Self {
            event: "scenario_runner_summary",
            scenarios: lines,
            total_passed,
            total_failed,
            total_elapsed_s: elapsed_s,
            overall_status: if all_pass { "PASS" } else { "FAIL" },
        }
    }

    fn print_table(&self) {
        let rule = "-".repeat(64);
        eprintln!("\n{rule}");
        eprintln!(" {:<30} {:>6} {:>9} {:>12}", "scenario", "status", "steps", "elapsed");
        eprintln!("{rule}");
        for line in &self.scenarios {
            eprintln!(
                " {:<30} {:>6} {:>4}/{:<4} {:>10.1}ms",
                line.scenario,
                line.status,
                line.passed,
                line.passed + line.failed,
                line.elapsed_ms
            );
        }
        eprintln!("{rule}");
        eprintln!(
            " {} passed, {} failed in {:.1}s: {}",
            self.total_passed, self.total_failed, self.total_elapsed_s, self.overall_status
        );
    }
}

/// Run `selected` against `cluster`. Returns `false` if anything failed.
pub async fn run(
    cluster: &mut Cluster,
    selected: &[Scenario],
    settings: &RunSettings,
) -> anyhow::Result<bool> {
    let started = Instant::now();
    let mut lines = Vec::with_capacity(selected.len());

    for &scenario in selected {
        eprintln!("\n== {} ==", scenario.name());
        let outcome = scenarios::run(cluster, scenario, settings).await;
        match &outcome {
            Ok(result) => {
                result.print_summary();
                emit(result);
            }
            Err(e) => eprintln!("[FAIL] {}: {e}", scenario.name()),
        }
        lines.push(ScenarioLine::from_outcome(scenario, &outcome));
    }

    let summary = RunnerSummary::new(lines, started.elapsed().as_secs_f64());
    emit(&summary);
    summary.print_table();
    Ok(summary.overall_status == "PASS")
}

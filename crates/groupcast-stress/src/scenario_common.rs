/// Result types and checks shared by every scenario.
use serde::Serialize;
use std::time::Instant;

/// Outcome of one timed step inside a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything a scenario reports, emitted as one JSONL record.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub event: &'static str,
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            event: "scenario_result",
            scenario: scenario.to_string(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = elapsed_ms(start);
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let verdict = if self.success() { "PASS" } else { "FAIL" };
        eprintln!(
            "{verdict} {} in {:.1}ms ({}/{} steps)",
            self.scenario,
            self.total_ms,
            self.passed,
            self.steps.len()
        );
        for step in &self.steps {
            let detail = step.detail.as_deref().unwrap_or("");
            let mark = if step.ok { "+" } else { "!" };
            eprintln!("  {mark} {:<24} {:>8.1}ms  {detail}", step.step, step.elapsed_ms);
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Time an async check. `Ok` carries an optional note, `Err` the reason.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let took = elapsed_ms(start);
    let (ok, detail) = match outcome {
        Ok(note) if note.is_empty() => (true, None),
        Ok(note) => (true, Some(note)),
        Err(reason) => (false, Some(reason)),
    };
    StepResult {
        step: name.to_string(),
        ok,
        elapsed_ms: took,
        detail,
    }
}

/// Regular messages: exactly `1..=n`, in that order.
pub fn check_ordered(values: &[u64], n: u64) -> Result<(), String> {
    let expected: Vec<u64> = (1..=n).collect();
    if values == expected.as_slice() {
        Ok(())
    } else {
        Err(format!("expected [1..={n}] in order, got {values:?}"))
    }
}

/// OOB messages: every value of `1..=n` present exactly once, any order.
pub fn check_presence(values: &[u64], n: u64) -> Result<(), String> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let expected: Vec<u64> = (1..=n).collect();
    if sorted == expected {
        Ok(())
    } else {
        Err(format!("expected each of 1..={n} once, got {values:?}"))
    }
}

use crate::output;
use groupcast_protocol::EngineStats;
use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
/// If --output-dir was provided, also writes to the JSONL file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::write_jsonl_line(&json);
    }
}

/// Seconds since the epoch, for JSONL timestamps.
pub fn now_iso() -> String {
    format!("{}s", chrono::Utc::now().timestamp())
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub members: usize,
    pub outgoing_copies: usize,
    pub incoming_copies: usize,
    pub drop_rate: f64,
    pub reorder_window: usize,
    pub seed: u64,
    pub timestamp: String,
}

// ── Per-member statistics ───────────────────────────────────────

#[derive(Serialize)]
pub struct EventMemberStats<'a> {
    pub event: &'static str,
    pub scenario: &'a str,
    pub member: String,
    pub stats: &'a EngineStats,
}

// ── Protocol events surfaced by a runtime ───────────────────────

#[derive(Serialize)]
pub struct EventProtocol {
    pub event: &'static str,
    pub scenario: String,
    pub member: String,
    pub detail: String,
    pub timestamp: String,
}

//! Live monitor state — best-effort observable state for external viewers.
//!
//! `monitor.json` is rewritten atomically on every transition. A write
//! failure must never disturb the loop, so everything here swallows errors
//! after logging them once at debug level.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::debug;

use herald_agent::LoopObserver;
use herald_core::types::ToolResultEntry;
use herald_providers::LlmResponse;

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct MonitorWriter {
    path: PathBuf,
}

impl MonitorWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Atomic write (temp + rename); failures swallowed.
    pub fn write(&self, state: &Value) {
        let result = (|| -> std::io::Result<()> {
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, state.to_string())?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(e) = result {
            debug!(error = %e, "monitor write failed");
        }
    }

    pub fn write_idle(&self) {
        self.write(&json!({ "state": "idle", "updated_at": now_ts() }));
    }
}

/// Loop observer that mirrors the turn lifecycle into the monitor file:
/// "thinking" while waiting on the provider, "tools" while calls run.
pub struct MonitorObserver {
    writer: MonitorWriter,
    contact: String,
    model: String,
    session_id: String,
    turn: AtomicU32,
    turn_started_at: f64,
    turns: Mutex<Vec<Value>>,
}

impl MonitorObserver {
    pub fn new(writer: MonitorWriter, contact: &str, model: &str, session_id: &str) -> Self {
        let observer = Self {
            writer,
            contact: contact.to_string(),
            model: model.to_string(),
            session_id: session_id.to_string(),
            turn: AtomicU32::new(1),
            turn_started_at: now_ts(),
            turns: Mutex::new(Vec::new()),
        };
        observer.write_state("thinking", Vec::new());
        observer
    }

    fn write_state(&self, state: &str, tools_in_flight: Vec<String>) {
        let turns = self.turns.lock().map(|t| t.clone()).unwrap_or_default();
        self.writer.write(&json!({
            "state": state,
            "contact": self.contact,
            "model": self.model,
            "session_id": self.session_id,
            "turn": self.turn.load(Ordering::SeqCst),
            "turn_started_at": self.turn_started_at,
            "updated_at": now_ts(),
            "tools_in_flight": tools_in_flight,
            "turns": turns,
        }));
    }
}

impl LoopObserver for MonitorObserver {
    fn on_response(&self, response: &LlmResponse) {
        if response.tool_calls.is_empty() {
            // Final turn — the dispatcher writes the idle state.
            return;
        }
        let names: Vec<String> = response.tool_calls.iter().map(|c| c.name.clone()).collect();
        if let Ok(mut turns) = self.turns.lock() {
            turns.push(json!({
                "turn": self.turn.load(Ordering::SeqCst),
                "tools": names,
            }));
        }
        self.write_state("tools", names);
    }

    fn on_tool_results(&self, _results: &[ToolResultEntry]) {
        self.turn.fetch_add(1, Ordering::SeqCst);
        self.write_state("thinking", Vec::new());
    }
}

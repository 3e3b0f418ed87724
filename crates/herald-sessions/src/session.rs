//! A single conversation session with dual storage.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use herald_core::types::{Message, ToolResultEntry, UserContent, Usage};

use crate::error::Result;

/// Truncation limit for tool output in the audit trail.
pub const AUDIT_TRUNCATION_LIMIT: usize = 500;

/// Cap on the summary text stored in a compaction event.
pub const COMPACTION_SUMMARY_LIMIT: usize = 2000;

pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One audit-trail event. The log is authoritative: snapshots can be
/// discarded and reconstructed from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Session creation marker.
    Session {
        id: String,
        model: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        contact: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_session: Option<String>,
    },
    /// A user or assistant message, stored verbatim.
    Message {
        #[serde(flatten)]
        message: Message,
    },
    /// One tool result, content truncated.
    ToolResult { tool_use_id: String, content: String },
    /// A compaction took place; `summary` is capped.
    Compaction {
        summary_tokens: u64,
        removed_messages: usize,
        compaction_number: u32,
        summary: String,
    },
}

#[derive(Serialize)]
struct TimedEvent<'a> {
    timestamp: f64,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Snapshot file contents. Field order is fixed so that
/// save → load → save produces identical bytes (except `updated_at`).
#[derive(Serialize, Deserialize)]
struct Snapshot {
    id: String,
    model: String,
    #[serde(default)]
    contact: String,
    messages: Vec<Message>,
    created_at: f64,
    #[serde(default)]
    total_input_tokens: u64,
    #[serde(default)]
    total_output_tokens: u64,
    #[serde(default)]
    compaction_count: u32,
    #[serde(default)]
    warned_about_compaction: bool,
    #[serde(default)]
    pending_system_warning: String,
    updated_at: f64,
}

/// Write to a temp file, fsync, then rename — atomic on POSIX.
pub(crate) fn atomic_write(path: &Path, data: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let result = (|| -> Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(data.as_bytes())?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// A single conversation session.
pub struct Session {
    pub id: String,
    dir: PathBuf,
    pub model: String,
    pub contact: String,
    pub messages: Vec<Message>,
    pub created_at: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub compaction_count: u32,
    pub warned_about_compaction: bool,
    /// One-shot operator note injected into the next inbound turn.
    pub pending_system_warning: String,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        sessions_dir: impl Into<PathBuf>,
        model: impl Into<String>,
        contact: impl Into<String>,
    ) -> Result<Self> {
        let dir = sessions_dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            id: session_id.into(),
            dir,
            model: model.into(),
            contact: contact.into(),
            messages: Vec::new(),
            created_at: now_ts(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            compaction_count: 0,
            warned_about_compaction: false,
            pending_system_warning: String::new(),
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}.state.json", self.id))
    }

    fn legacy_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.id))
    }

    /// Audit chunk for today's local date.
    fn dated_log_path(&self) -> PathBuf {
        let today = Local::now().format("%Y-%m-%d");
        self.dir.join(format!("{}.{}.jsonl", self.id, today))
    }

    /// All dated audit chunks for this session, ascending.
    fn dated_chunks(&self) -> Vec<PathBuf> {
        let prefix = format!("{}.", self.id);
        let mut chunks: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
                            return false;
                        };
                        name.strip_prefix(&prefix)
                            .and_then(|rest| rest.strip_suffix(".jsonl"))
                            .map(is_date_stamp)
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort();
        chunks
    }

    /// Migrate an undated legacy log to the dated format (runs once).
    fn migrate_legacy_log(&self) {
        let legacy = self.legacy_log_path();
        if !legacy.exists() {
            return;
        }
        let result = (|| -> Result<()> {
            let first_line = BufReader::new(File::open(&legacy)?)
                .lines()
                .next()
                .transpose()?
                .unwrap_or_default();
            if first_line.trim().is_empty() {
                return Ok(());
            }
            let first: serde_json::Value = serde_json::from_str(first_line.trim())?;
            let ts = first
                .get("timestamp")
                .and_then(|t| t.as_f64())
                .unwrap_or_else(now_ts);
            let start_date = Local
                .timestamp_opt(ts as i64, 0)
                .single()
                .unwrap_or_else(Local::now)
                .format("%Y-%m-%d")
                .to_string();
            let target = self.dir.join(format!("{}.{}.jsonl", self.id, start_date));
            if !target.exists() {
                std::fs::rename(&legacy, &target)?;
            } else {
                // Both exist: append the legacy contents, then drop the
                // legacy file.
                let contents = std::fs::read_to_string(&legacy)?;
                let mut dst = OpenOptions::new().append(true).open(&target)?;
                dst.write_all(contents.as_bytes())?;
                dst.sync_all()?;
                std::fs::remove_file(&legacy)?;
            }
            info!(session = %self.id, "migrated legacy audit log to dated format");
            Ok(())
        })();
        if let Err(e) = result {
            warn!(session = %self.id, error = %e, "legacy audit log migration failed");
        }
    }

    /// Load from the snapshot if present; rebuild from the audit trail when
    /// the snapshot is corrupt. Returns true if any state was loaded.
    pub fn load(&mut self) -> bool {
        self.migrate_legacy_log();
        let state_path = self.state_path();
        if !state_path.exists() {
            return false;
        }
        match std::fs::read_to_string(&state_path)
            .map_err(crate::error::SessionError::from)
            .and_then(|data| Ok(serde_json::from_str::<Snapshot>(&data)?))
        {
            Ok(snapshot) => {
                self.messages = snapshot.messages;
                if !snapshot.model.is_empty() {
                    self.model = snapshot.model;
                }
                if !snapshot.contact.is_empty() {
                    self.contact = snapshot.contact;
                }
                self.created_at = snapshot.created_at;
                self.total_input_tokens = snapshot.total_input_tokens;
                self.total_output_tokens = snapshot.total_output_tokens;
                self.compaction_count = snapshot.compaction_count;
                self.warned_about_compaction = snapshot.warned_about_compaction;
                self.pending_system_warning = snapshot.pending_system_warning;
                info!(session = %self.id, messages = self.messages.len(), "resumed session");
                true
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "corrupt state file, rebuilding from audit log");
                self.rebuild_from_log()
            }
        }
    }

    /// Replay the audit trail (legacy + dated chunks, chronological).
    pub fn rebuild_from_log(&mut self) -> bool {
        let legacy = self.legacy_log_path();
        let mut chunks: Vec<PathBuf> = Vec::new();
        if legacy.exists() {
            chunks.push(legacy);
        }
        chunks.extend(self.dated_chunks());
        if chunks.is_empty() {
            return false;
        }

        self.messages.clear();
        self.total_input_tokens = 0;
        self.total_output_tokens = 0;
        self.compaction_count = 0;

        let result = (|| -> Result<usize> {
            let mut replayed = 0usize;
            for chunk in &chunks {
                let file = File::open(chunk)?;
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = serde_json::from_str(line)?;
                    match value.get("type").and_then(|t| t.as_str()) {
                        Some("message") => {
                            let message: Message = serde_json::from_value(value)?;
                            if let Message::Assistant { usage, .. } = &message {
                                self.total_input_tokens += usage.input_tokens;
                                self.total_output_tokens += usage.output_tokens;
                            }
                            self.messages.push(message);
                            replayed += 1;
                        }
                        Some("compaction") => {
                            self.compaction_count += 1;
                            let summary = value
                                .get("summary")
                                .and_then(|s| s.as_str())
                                .unwrap_or_default();
                            if !summary.is_empty() {
                                // Post-compaction state: everything before
                                // this event collapses into the summary.
                                self.messages = vec![Message::user(
                                    format!("[Previous conversation summary]\n{summary}"),
                                    "",
                                    "",
                                )];
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(replayed)
        })();

        match result {
            Ok(_) => {
                info!(
                    session = %self.id,
                    chunks = chunks.len(),
                    messages = self.messages.len(),
                    "rebuilt session from audit log"
                );
                true
            }
            Err(e) => {
                error!(session = %self.id, error = %e, "failed to rebuild session from audit log");
                false
            }
        }
    }

    /// Atomically save the current snapshot.
    pub fn save_state(&self) -> Result<()> {
        let snapshot = Snapshot {
            id: self.id.clone(),
            model: self.model.clone(),
            contact: self.contact.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            compaction_count: self.compaction_count,
            warned_about_compaction: self.warned_about_compaction,
            pending_system_warning: self.pending_system_warning.clone(),
            updated_at: now_ts(),
        };
        atomic_write(&self.state_path(), &serde_json::to_string(&snapshot)?)
    }

    /// Append one event to today's audit chunk, fsync'd.
    pub fn append_event(&self, event: &AuditEvent) -> Result<()> {
        let timed = TimedEvent {
            timestamp: now_ts(),
            event,
        };
        let mut line = serde_json::to_string(&timed)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dated_log_path())?;
        f.write_all(line.as_bytes())?;
        f.flush()?;
        f.sync_all()?;
        Ok(())
    }

    pub fn add_user_message(
        &mut self,
        content: impl Into<UserContent>,
        sender: &str,
        source: &str,
    ) -> Result<()> {
        let message = Message::User {
            content: content.into(),
            sender: sender.to_string(),
            source: source.to_string(),
        };
        self.messages.push(message.clone());
        self.append_event(&AuditEvent::Message { message })?;
        self.save_state()
    }

    pub fn add_assistant_message(&mut self, message: Message) -> Result<()> {
        if let Message::Assistant { usage, .. } = &message {
            self.total_input_tokens += usage.input_tokens;
            self.total_output_tokens += usage.output_tokens;
        }
        self.messages.push(message.clone());
        self.append_event(&AuditEvent::Message { message })?;
        self.save_state()
    }

    pub fn add_tool_results(&mut self, results: Vec<ToolResultEntry>) -> Result<()> {
        self.persist_tool_results(&results)?;
        self.messages.push(Message::ToolResults { results });
        self.save_state()
    }

    /// Record an assistant message the agentic loop already appended to
    /// `messages` in place: audit + token totals, no re-append.
    pub fn persist_assistant_message(&mut self, message: &Message) -> Result<()> {
        if let Message::Assistant { usage, .. } = message {
            self.total_input_tokens += usage.input_tokens;
            self.total_output_tokens += usage.output_tokens;
        }
        self.append_event(&AuditEvent::Message {
            message: message.clone(),
        })
    }

    /// Record tool results the loop already appended in place.
    pub fn persist_tool_results(&self, results: &[ToolResultEntry]) -> Result<()> {
        for r in results {
            let content: String = r.content.text().chars().take(AUDIT_TRUNCATION_LIMIT).collect();
            self.append_event(&AuditEvent::ToolResult {
                tool_use_id: r.tool_call_id.clone(),
                content,
            })?;
        }
        Ok(())
    }

    /// Record a completed compaction: replace history, bump counters, persist.
    pub fn record_compaction(
        &mut self,
        new_messages: Vec<Message>,
        removed_messages: usize,
        summary: &str,
        summary_usage: Usage,
    ) -> Result<()> {
        self.messages = new_messages;
        self.compaction_count += 1;
        self.warned_about_compaction = false;
        self.save_state()?;
        self.append_event(&AuditEvent::Compaction {
            summary_tokens: summary_usage.output_tokens,
            removed_messages,
            compaction_number: self.compaction_count,
            summary: summary.chars().take(COMPACTION_SUMMARY_LIMIT).collect(),
        })
    }

    /// Input tokens reported on the most recent assistant message.
    pub fn last_input_tokens(&self) -> u64 {
        for message in self.messages.iter().rev() {
            if let Message::Assistant { usage, .. } = message {
                return usage.input_tokens;
            }
        }
        0
    }

    pub fn needs_compaction(&self, threshold: u64) -> bool {
        self.last_input_tokens() > threshold
    }
}

fn is_date_stamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

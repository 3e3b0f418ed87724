//! Session routing and lifecycle — index, archive, recall, close callbacks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use herald_core::types::Message;

use crate::error::Result;
use crate::session::{atomic_write, now_ts, AuditEvent, Session};

/// Fired before a session is archived; the session is still fully readable.
/// Failures are logged and never propagate.
pub type CloseCallback =
    Box<dyn for<'a> Fn(&'a Session) -> BoxFuture<'a, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    session_id: String,
    created_at: f64,
}

/// Read-only view of an active session, for the HTTP `/sessions` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub contact: String,
    pub session_id: String,
    pub model: String,
    pub messages: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub compaction_count: u32,
    pub created_at: f64,
    /// "idle" or "processing" (the dispatcher currently holds the session).
    pub state: String,
}

/// Manages session routing and lifecycle.
///
/// The dispatcher owns this behind a lock and holds it only briefly; each
/// session has its own `Mutex` so long agentic loops never block the
/// `/sessions` read path.
pub struct SessionManager {
    dir: PathBuf,
    index_path: PathBuf,
    agent_name: String,
    index: HashMap<String, IndexEntry>,
    active: HashMap<String, Arc<Mutex<Session>>>,
    callbacks: Vec<CloseCallback>,
}

impl SessionManager {
    pub fn new(sessions_dir: impl Into<PathBuf>, agent_name: impl Into<String>) -> Result<Self> {
        let dir = sessions_dir.into();
        std::fs::create_dir_all(&dir)?;
        let index_path = dir.join("sessions.json");
        let index = match std::fs::read_to_string(&index_path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            dir,
            index_path,
            agent_name: agent_name.into(),
            index,
            active: HashMap::new(),
            callbacks: Vec::new(),
        })
    }

    fn save_index(&self) -> Result<()> {
        atomic_write(&self.index_path, &serde_json::to_string_pretty(&self.index)?)
    }

    /// Return the existing session for a contact, loading or creating it.
    pub fn get_or_create(&mut self, contact: &str, model: &str) -> Result<Arc<Mutex<Session>>> {
        if let Some(session) = self.active.get(contact) {
            return Ok(session.clone());
        }

        if let Some(entry) = self.index.get(contact) {
            let mut session = Session::new(entry.session_id.clone(), &self.dir, model, contact)?;
            if session.load() {
                let session = Arc::new(Mutex::new(session));
                self.active.insert(contact.to_string(), session.clone());
                return Ok(session);
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let session = Session::new(session_id.clone(), &self.dir, model, contact)?;
        session.append_event(&AuditEvent::Session {
            id: session_id.clone(),
            model: model.to_string(),
            contact: contact.to_string(),
            parent_session: None,
        })?;
        self.index.insert(
            contact.to_string(),
            IndexEntry {
                session_id: session_id.clone(),
                created_at: now_ts(),
            },
        );
        self.save_index()?;
        info!(session = %session_id, contact, "created session");
        let session = Arc::new(Mutex::new(session));
        self.active.insert(contact.to_string(), session.clone());
        Ok(session)
    }

    /// Register a callback fired before a session is archived. Callbacks run
    /// in registration order.
    pub fn on_close(&mut self, callback: CloseCallback) {
        self.callbacks.push(callback);
    }

    /// Close and archive the session for a contact. The next inbound message
    /// starts a fresh session. Returns false when the contact has none.
    pub async fn close_session(&mut self, contact: &str) -> Result<bool> {
        if let Some(session) = self.active.remove(contact) {
            let session = session.lock().await;
            for callback in &self.callbacks {
                if let Err(e) = callback(&session).await {
                    error!(contact, error = %e, "on_close callback failed");
                }
            }
        }

        let Some(entry) = self.index.remove(contact) else {
            return Ok(false);
        };

        // Archive, never delete: move every file belonging to the session.
        let archive = self.dir.join(".archive");
        std::fs::create_dir_all(&archive)?;
        let prefix = entry.session_id.clone();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) {
                std::fs::rename(dir_entry.path(), archive.join(name))?;
            }
        }

        self.save_index()?;
        info!(session = %entry.session_id, contact, "archived session");
        Ok(true)
    }

    /// Close a session by its id (linear scan over the index).
    pub async fn close_session_by_id(&mut self, session_id: &str) -> Result<bool> {
        let contact = self
            .index
            .iter()
            .find(|(_, entry)| entry.session_id == session_id)
            .map(|(contact, _)| contact.clone());
        match contact {
            Some(contact) => self.close_session(&contact).await,
            None => Ok(false),
        }
    }

    /// One-off session for a sub-agent; never enters the index.
    pub fn create_subagent_session(&self, parent_id: &str, model: &str) -> Result<Session> {
        let session_id = format!("sub-{}", Uuid::new_v4());
        let session = Session::new(session_id.clone(), &self.dir, model, "")?;
        session.append_event(&AuditEvent::Session {
            id: session_id,
            model: model.to_string(),
            contact: String::new(),
            parent_session: Some(parent_id.to_string()),
        })?;
        Ok(session)
    }

    /// Read-only snapshots of all active sessions.
    ///
    /// Never blocks on a session the dispatcher is driving through a long
    /// agentic loop: busy sessions are reported from the index instead.
    pub async fn list_active(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for (contact, session) in &self.active {
            match session.try_lock() {
                Ok(session) => infos.push(SessionInfo {
                    contact: contact.clone(),
                    session_id: session.id.clone(),
                    model: session.model.clone(),
                    messages: session.messages.len(),
                    total_input_tokens: session.total_input_tokens,
                    total_output_tokens: session.total_output_tokens,
                    compaction_count: session.compaction_count,
                    created_at: session.created_at,
                    state: "idle".into(),
                }),
                Err(_) => {
                    let entry = self.index.get(contact);
                    infos.push(SessionInfo {
                        contact: contact.clone(),
                        session_id: entry.map(|e| e.session_id.clone()).unwrap_or_default(),
                        model: String::new(),
                        messages: 0,
                        total_input_tokens: 0,
                        total_output_tokens: 0,
                        compaction_count: 0,
                        created_at: entry.map(|e| e.created_at).unwrap_or(0.0),
                        state: "processing".into(),
                    });
                }
            }
        }
        infos.sort_by(|a, b| a.contact.cmp(&b.contact));
        infos
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Build recall text from the most recent archived session for a contact.
    ///
    /// Returns a formatted conversation excerpt, or an empty string when the
    /// contact has no archived history.
    pub fn build_recall(&self, contact: &str, count: usize) -> String {
        let archive = self.dir.join(".archive");
        if !archive.is_dir() {
            return String::new();
        }

        // Newest archived snapshot belonging to this contact.
        let mut best: Option<(std::time::SystemTime, serde_json::Value)> = None;
        let Ok(entries) = std::fs::read_dir(&archive) else {
            return String::new();
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".state.json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<serde_json::Value>(&data) else {
                continue;
            };
            let mut file_contact = state
                .get("contact")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            if file_contact.is_empty() {
                // Older snapshots lack the contact field; fall back to the
                // session event in the first archived audit chunk.
                let session_id = state.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                file_contact = self.contact_from_archived_log(&archive, session_id);
            }
            if file_contact != contact {
                continue;
            }
            let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if best.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                best = Some((mtime, state));
            }
        }

        let Some((_, state)) = best else {
            return String::new();
        };
        let Ok(messages) = serde_json::from_value::<Vec<Message>>(
            state.get("messages").cloned().unwrap_or_default(),
        ) else {
            return String::new();
        };

        let conversation: Vec<&Message> = messages
            .iter()
            .filter(|m| matches!(m, Message::User { .. } | Message::Assistant { .. }))
            .collect();
        let tail = &conversation[conversation.len().saturating_sub(count)..];

        let mut lines = Vec::new();
        for message in tail {
            match message {
                Message::User { content, .. } => {
                    let mut text = content.text();
                    // Strip the "[timestamp]\n" envelope the dispatcher adds.
                    if text.starts_with('[') {
                        if let Some(pos) = text[..text.len().min(60)].find("]\n") {
                            text = text[pos + 2..].to_string();
                        }
                    }
                    lines.push(format!("**{contact}:** {text}"));
                }
                Message::Assistant { text: Some(text), .. } if !text.is_empty() => {
                    lines.push(format!("**{}:** {}", self.agent_name, text));
                }
                _ => {}
            }
        }

        if lines.is_empty() {
            return String::new();
        }
        format!("Session recall (last conversation):\n\n{}", lines.join("\n\n"))
    }

    fn contact_from_archived_log(&self, archive: &std::path::Path, session_id: &str) -> String {
        if session_id.is_empty() {
            return String::new();
        }
        let prefix = format!("{session_id}.");
        let mut chunks: Vec<PathBuf> = match std::fs::read_dir(archive) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix) && n.ends_with(".jsonl"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => return String::new(),
        };
        chunks.sort();
        let Some(first) = chunks.first() else {
            return String::new();
        };
        let Ok(data) = std::fs::read_to_string(first) else {
            return String::new();
        };
        for line in data.lines() {
            let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if event.get("type").and_then(|t| t.as_str()) == Some("session") {
                return event
                    .get("contact")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::Usage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(dir: &tempfile::TempDir) -> SessionManager {
        SessionManager::new(dir.path(), "Herald").unwrap()
    }

    async fn seed_conversation(manager: &mut SessionManager, contact: &str) {
        let session = manager.get_or_create(contact, "primary").unwrap();
        let mut session = session.lock().await;
        session
            .add_user_message("[2026-07-30 10:11]\nhello there", contact, "telegram")
            .unwrap();
        session
            .add_assistant_message(Message::Assistant {
                text: Some("hi! how can I help?".into()),
                tool_calls: Vec::new(),
                thinking: None,
                thinking_block: None,
                usage: Usage::default(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn get_or_create_is_stable_per_contact() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir);
        let a = manager.get_or_create("alice", "primary").unwrap();
        let b = manager.get_or_create("alice", "primary").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = manager.get_or_create("bob", "primary").unwrap();
        assert_ne!(a.lock().await.id, c.lock().await.id);
    }

    #[tokio::test]
    async fn index_survives_manager_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut m = manager(&dir);
            seed_conversation(&mut m, "alice").await;
            m.get_or_create("alice", "primary").unwrap().lock().await.id.clone()
        };
        let mut m2 = manager(&dir);
        let resumed = m2.get_or_create("alice", "primary").unwrap();
        let resumed = resumed.lock().await;
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.messages.len(), 2);
    }

    #[tokio::test]
    async fn close_archives_files_and_clears_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        seed_conversation(&mut m, "alice").await;
        let id = m.get_or_create("alice", "primary").unwrap().lock().await.id.clone();

        assert!(m.close_session("alice").await.unwrap());
        assert!(!m.close_session("alice").await.unwrap());

        let archive = dir.path().join(".archive");
        assert!(archive.join(format!("{id}.state.json")).exists());
        assert!(!dir.path().join(format!("{id}.state.json")).exists());

        // a new message starts a fresh session
        let fresh = m.get_or_create("alice", "primary").unwrap();
        assert_ne!(fresh.lock().await.id, id);
    }

    #[tokio::test]
    async fn close_callbacks_fire_in_order_and_failures_are_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        seed_conversation(&mut m, "alice").await;

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        m.on_close(Box::new(
            |_session: &Session| -> futures_util::future::BoxFuture<'_, Result<()>> {
                Box::pin(async {
                    assert_eq!(CALLS.fetch_add(1, Ordering::SeqCst), 0);
                    Err(crate::error::SessionError::NotFound("boom".into()))
                })
            },
        ));
        m.on_close(Box::new(
            |session: &Session| -> futures_util::future::BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    assert!(!session.messages.is_empty());
                    CALLS.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        ));

        assert!(m.close_session("alice").await.unwrap());
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recall_formats_the_archived_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        seed_conversation(&mut m, "alice").await;
        m.close_session("alice").await.unwrap();

        let recall = m.build_recall("alice", 20);
        assert!(recall.starts_with("Session recall (last conversation):\n\n"));
        // timestamp envelope stripped from the user line
        assert!(recall.contains("**alice:** hello there"));
        assert!(recall.contains("**Herald:** hi! how can I help?"));
        assert_eq!(m.build_recall("stranger", 20), "");
    }

    #[tokio::test]
    async fn subagent_sessions_stay_out_of_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let sub = m.create_subagent_session("parent-123", "primary").unwrap();
        assert!(sub.id.starts_with("sub-"));
        let index = std::fs::read_to_string(dir.path().join("sessions.json")).unwrap_or_default();
        assert!(!index.contains(&sub.id));
    }

    #[tokio::test]
    async fn list_active_reports_read_only_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        seed_conversation(&mut m, "alice").await;
        let infos = m.list_active().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].contact, "alice");
        assert_eq!(infos[0].messages, 2);
        assert_eq!(infos[0].state, "idle");

        // a session held by the dispatcher is reported, not awaited
        let held = m.get_or_create("alice", "primary").unwrap();
        let guard = held.lock().await;
        let infos = m.list_active().await;
        assert_eq!(infos[0].state, "processing");
        assert_eq!(infos[0].session_id, guard.id);
    }
}

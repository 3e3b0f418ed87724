//! The dispatcher — single consumer of the work queue.
//!
//! One item at a time: resolve the session, build the prompt, run the
//! agentic loop, persist what the loop appended, then deliver the reply
//! through whichever path the item arrived on. Per-contact ordering falls
//! out of the single-consumer design; no session-level locking discipline
//! is needed beyond the session's own mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use herald_agent::{compact_session, run_agentic_loop, CostLedger, LoopOptions};
use herald_core::channel::Channel;
use herald_core::config::HeraldConfig;
use herald_core::types::{Message, NotifyMeta, ReplyPath, WorkItem};
use herald_providers::Provider;
use herald_sessions::SessionManager;
use herald_tools::registry::ToolRegistry;

use crate::attach::build_user_content;
use crate::context::build_context;
use crate::monitor::{MonitorObserver, MonitorWriter};

pub struct Dispatcher {
    pub config: HeraldConfig,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<Mutex<SessionManager>>,
    pub ledger: CostLedger,
    pub channel: Option<Arc<dyn Channel>>,
    pub monitor: MonitorWriter,
    /// Last inbound timestamp per sender, for the react tool.
    pub inbound_timestamps: Arc<DashMap<String, i64>>,
    pub http_client: reqwest::Client,
}

impl Dispatcher {
    pub async fn run(self, mut queue: mpsc::Receiver<WorkItem>) {
        info!("dispatcher running");
        while let Some(item) = queue.recv().await {
            self.handle(item).await;
        }
        info!("dispatcher queue closed, exiting");
    }

    async fn handle(&self, item: WorkItem) {
        let WorkItem {
            sender,
            source,
            text,
            tier,
            attachments,
            reply,
        } = item;
        info!(sender = %sender, source = %source, "processing work item");
        self.inbound_timestamps
            .insert(sender.clone(), chrono::Utc::now().timestamp());

        let model_name = self.config.route_model(&source).to_string();
        let Some(provider) = self.providers.get(&model_name) else {
            error!(model = %model_name, "no provider for routed model");
            self.deliver(reply, &sender, &self.config.agent.error_message, "", "")
                .await;
            return;
        };
        let model_cfg = self.config.model(&model_name).cloned().unwrap_or_default();

        let session_arc = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_or_create(&sender, &model_name) {
                Ok(session) => session,
                Err(e) => {
                    error!(sender = %sender, error = %e, "session resolution failed");
                    self.deliver(reply, &sender, &self.config.agent.error_message, "", "")
                        .await;
                    return;
                }
            }
        };
        let mut session = session_arc.lock().await;

        // A fresh session gets an excerpt of the contact's last archived
        // conversation injected into its system prompt.
        let recall = if session.messages.is_empty() {
            let sessions = self.sessions.lock().await;
            sessions.build_recall(&sender, self.config.session.recall_count)
        } else {
            String::new()
        };

        // Compose the inbound user message. The pending system warning is
        // one-shot: consumed here, cleared in the snapshot.
        let warning = std::mem::take(&mut session.pending_system_warning);
        let mut inbound = format!("[{}]\n{}", Local::now().format("%Y-%m-%d %H:%M"), text);
        if !warning.is_empty() {
            inbound = format!("[system: {warning}]\n\n{inbound}");
        }
        let content = build_user_content(inbound, &attachments);
        if let Err(e) = session.add_user_message(content, &sender, &source) {
            warn!(session = %session.id, error = %e, "failed to persist user message");
        }

        let system_blocks = build_context(&self.config, &self.registry, &tier, &session, &recall);
        let fmt_system = provider.format_system(&system_blocks);
        let schemas = self.registry.get_schemas();

        let options = LoopOptions {
            max_turns: self.config.agentic.max_turns,
            timeout: Duration::from_secs(self.config.agentic.timeout_secs),
            session_id: session.id.clone(),
            model_name: model_cfg.model.clone(),
            cost_rates: model_cfg.cost_per_mtok.clone(),
            max_cost: model_cfg.max_cost,
        };

        // Live monitor: "thinking" now, flipped by the observer, always
        // finalized to idle below.
        let observer = MonitorObserver::new(
            self.monitor.clone(),
            &sender,
            &model_cfg.model,
            &session.id,
        );

        let mark = session.messages.len();
        let result = run_agentic_loop(
            provider.as_ref(),
            &fmt_system,
            &mut session.messages,
            &schemas,
            &self.registry,
            Some(&self.ledger),
            &options,
            Some(&observer),
        )
        .await;

        // The loop mutated session.messages in place; record audit events
        // for everything it appended, without re-appending.
        let appended: Vec<Message> = session.messages[mark..].to_vec();
        for message in &appended {
            let persisted = match message {
                Message::Assistant { .. } => session.persist_assistant_message(message),
                Message::ToolResults { results } => session.persist_tool_results(results),
                Message::User { .. } => Ok(()),
            };
            if let Err(e) = persisted {
                warn!(session = %session.id, error = %e, "audit append failed");
            }
        }
        if let Err(e) = session.save_state() {
            warn!(session = %session.id, error = %e, "snapshot save failed");
        }

        let reply_text = match result {
            Ok(response) => response.text.unwrap_or_default(),
            Err(e) => {
                error!(session = %session.id, error = %e, "agentic loop failed");
                self.config.agent.error_message.clone()
            }
        };

        // Compaction: warn the model once, compact on the next breach.
        let threshold = self.config.session.compaction_threshold;
        if session.needs_compaction(threshold) {
            if !session.warned_about_compaction {
                session.warned_about_compaction = true;
                session.pending_system_warning =
                    "Context is near the compaction threshold; older messages will be \
                     summarized soon. Note down anything that must survive verbatim."
                        .to_string();
                if let Err(e) = session.save_state() {
                    warn!(session = %session.id, error = %e, "snapshot save failed");
                }
            } else {
                let summarizer_name = self.config.route_model("summarizer");
                if let Some(summarizer) = self.providers.get(summarizer_name) {
                    compact_session(
                        &mut session,
                        summarizer.as_ref(),
                        &self.config.session.compaction_prompt,
                    )
                    .await;
                }
            }
        }

        let session_id = session.id.clone();
        drop(session);

        self.monitor.write_idle();
        self.deliver(reply, &sender, &reply_text, &session_id, &model_cfg.model)
            .await;
    }

    async fn deliver(
        &self,
        reply: ReplyPath,
        sender: &str,
        text: &str,
        session_id: &str,
        model: &str,
    ) {
        match reply {
            ReplyPath::Http(future) => {
                let _ = future.send(json!({
                    "response": text,
                    "session_id": session_id,
                    "model": model,
                }));
            }
            ReplyPath::Channel => {
                let Some(channel) = &self.channel else {
                    warn!(sender, "no channel wired, dropping reply");
                    return;
                };
                if let Err(e) = channel.send(sender, text, &[]).await {
                    error!(sender, error = %e, "channel reply failed");
                }
            }
            ReplyPath::System { notify_meta } => {
                if let Some(meta) = notify_meta {
                    self.echo_webhook(meta, text).await;
                }
            }
        }
    }

    /// Echo the agent's answer back to the configured webhook.
    /// Fire-and-forget: failures are logged, never retried.
    async fn echo_webhook(&self, meta: NotifyMeta, text: &str) {
        let url = self.config.http.callback_url.clone();
        if url.is_empty() {
            return;
        }
        let mut request = self.http_client.post(&url).json(&json!({
            "reply": text,
            "source": meta.source,
            "ref": meta.reference,
            "data": meta.data,
        }));
        let token = self.config.http_callback_token();
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        match request.timeout(Duration::from_secs(10)).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "webhook echo-back rejected"),
            Err(e) => warn!(error = %e, "webhook echo-back failed"),
        }
    }
}

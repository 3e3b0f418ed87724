//! POST /api/v1/notify — fire-and-forget system notifications.
//!
//! Notifications run at the operational tier and never produce a reply to
//! the caller; the dispatcher's answer goes to the webhook when `notify_meta`
//! is present.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use herald_core::config::resolve_path;
use herald_core::types::{NotifyMeta, ReplyPath, WorkItem};

use crate::app::AppState;
use crate::attach::decode_attachments;
use crate::http::chat::error_response;

pub async fn handle(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let Some(body) = body.as_object() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .trim();
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "\"message\" field is required");
    }

    let sender = crate::http::chat::http_sender(body.get("sender").and_then(|s| s.as_str()));
    let source_label = body.get("source").and_then(|s| s.as_str()).unwrap_or("");
    let reference = body.get("ref").and_then(|r| r.as_str()).unwrap_or("");
    let data = body.get("data").cloned();

    let mut parts: Vec<String> = Vec::new();
    if !source_label.is_empty() {
        parts.push(format!("[source: {source_label}]"));
    }
    if !reference.is_empty() {
        parts.push(format!("[ref: {reference}]"));
    }
    parts.push(message.to_string());
    let text = format!("[AUTOMATED SYSTEM MESSAGE] {}", parts.join(" "));

    let notify_meta = if source_label.is_empty() && reference.is_empty() && data.is_none() {
        None
    } else {
        Some(NotifyMeta {
            source: (!source_label.is_empty()).then(|| source_label.to_string()),
            reference: (!reference.is_empty()).then(|| reference.to_string()),
            data,
        })
    };

    let attachments = body
        .get("attachments")
        .and_then(|a| a.as_array())
        .map(|raw| decode_attachments(raw, &resolve_path(&state.config.http.download_dir)))
        .unwrap_or_default();

    let item = WorkItem {
        sender: sender.clone(),
        source: "system".into(),
        text,
        tier: "operational".into(),
        attachments,
        reply: ReplyPath::System { notify_meta },
    };
    if state.queue.send(item).await.is_err() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "dispatcher unavailable");
    }
    info!(sender = %sender, source = source_label, reference, "notify queued");

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "queued_at": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        })),
    )
        .into_response()
}

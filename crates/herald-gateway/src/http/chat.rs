//! POST /api/v1/chat — synchronous: enqueue, await the dispatcher's reply.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{error, info};

use herald_core::config::resolve_path;
use herald_core::types::{ReplyPath, WorkItem};

use crate::app::AppState;
use crate::attach::decode_attachments;

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

    let sender = http_sender(body.get("sender").and_then(|s| s.as_str()));
    let context = body.get("context").and_then(|c| c.as_str()).unwrap_or("");
    let tier = body.get("tier").and_then(|t| t.as_str()).unwrap_or("full");
    let text = if context.is_empty() {
        message.to_string()
    } else {
        format!("[{context}] {message}")
    };

    let attachments = body
        .get("attachments")
        .and_then(|a| a.as_array())
        .map(|raw| decode_attachments(raw, &resolve_path(&state.config.http.download_dir)))
        .unwrap_or_default();

    let (reply_tx, reply_rx) = oneshot::channel();
    let item = WorkItem {
        sender: sender.clone(),
        source: "http".into(),
        text,
        tier: tier.into(),
        attachments,
        reply: ReplyPath::Http(reply_tx),
    };

    if state.queue.send(item).await.is_err() {
        error!("dispatcher queue closed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "dispatcher unavailable");
    }
    info!(sender = %sender, context, "chat queued");

    let timeout = Duration::from_secs(state.config.http.agent_timeout_secs);
    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Ok(Err(_dropped)) => {
            error!(sender = %sender, "dispatcher dropped the reply future");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "processing failed")
        }
        Err(_) => {
            error!(sender = %sender, "chat timed out");
            error_response(StatusCode::REQUEST_TIMEOUT, "processing timeout")
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Prefix every HTTP-originated sender so an HTTP client can never land in
/// a transport contact's session (e.g. by submitting a phone number).
pub(crate) fn http_sender(raw: Option<&str>) -> String {
    format!("http-{}", raw.unwrap_or("default"))
}

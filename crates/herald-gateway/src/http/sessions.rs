//! GET /api/v1/sessions — read-only snapshots of active sessions.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn handle(State(state): State<Arc<AppState>>) -> Json<Value> {
    let infos = {
        let sessions = state.sessions.lock().await;
        sessions.list_active().await
    };
    Json(json!({ "sessions": infos }))
}

//! GET /api/v1/status — health check + daemon stats. Auth-exempt.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn handle(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active_sessions = state.sessions.lock().await.active_count();
    let today_cost = state.ledger.today_cost().await;
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_seconds(),
        "active_sessions": active_sessions,
        "today_cost": today_cost,
    }))
}

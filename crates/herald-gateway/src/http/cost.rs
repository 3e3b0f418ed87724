//! GET /api/v1/cost?period=today|week|all — aggregated spend from the
//! ledger. The week window matches the operator CLI: trailing 7 days.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app::AppState;
use crate::http::chat::error_response;

pub async fn handle(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let period = params.get("period").map(String::as_str).unwrap_or("today");
    if !matches!(period, "today" | "week" | "all") {
        return error_response(
            StatusCode::BAD_REQUEST,
            "period must be 'today', 'week', or 'all'",
        );
    }
    let report = state.ledger.query(period).await;
    (StatusCode::OK, Json(report)).into_response()
}

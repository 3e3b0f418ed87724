//! REST surface under `/api/v1`.
//!
//! Middleware chain, outermost first: body limit → auth → rate limit →
//! handler.

pub mod chat;
pub mod cost;
pub mod notify;
pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::app::AppState;
use crate::{auth, rate_limit};

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/chat", post(chat::handle))
        .route("/notify", post(notify::handle))
        .route("/status", get(status::handle))
        .route("/sessions", get(sessions::handle))
        .route("/cost", get(cost::handle));

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce_rate_limit,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer))
        .layer(DefaultBodyLimit::max(state.config.http.max_body_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

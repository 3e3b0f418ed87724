//! Sliding-window rate limiting per remote address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;

use crate::app::AppState;

/// Sliding window: at most `max_requests` hits per key per `window`.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: DashMap::new(),
        }
    }

    /// Record a hit for `key`; false when the window is already full.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.entry(key.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push(now);
        true
    }
}

/// Status-family endpoints get the lenient limiter; chat/notify the tight
/// one.
pub async fn enforce_rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = addr.ip().to_string();
    let limiter = match req.uri().path() {
        "/api/v1/status" | "/api/v1/sessions" | "/api/v1/cost" => &state.status_limiter,
        _ => &state.chat_limiter,
    };
    if !limiter.check(&key) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }
    next.run(req).await
}

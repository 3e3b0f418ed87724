//! Bearer-token auth middleware.
//!
//! The expected token is hashed once at startup; each request's attempt is
//! hashed to the same fixed length and compared with `ct_eq`, so the check
//! leaks neither content nor length. `/api/v1/status` stays open for health
//! probes; a missing token configuration denies everything else with 503.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::app::AppState;

const AUTH_EXEMPT: [&str; 1] = ["/api/v1/status"];

pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if AUTH_EXEMPT.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let Some(expected_hash) = &state.api_token_hash else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "No auth token configured" })),
        )
            .into_response();
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !token_matches(provided, expected_hash) {
        warn!(path = %req.uri().path(), "auth failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Constant-time token check: hash the attempt to 32 bytes, then `ct_eq`.
pub fn token_matches(provided: &str, expected_hash: &[u8; 32]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected_hash.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(token: &str) -> [u8; 32] {
        Sha256::digest(token.as_bytes()).into()
    }

    #[test]
    fn exact_token_matches() {
        let expected = hash("secret-token");
        assert!(token_matches("secret-token", &expected));
    }

    #[test]
    fn prefixes_and_other_lengths_fail() {
        let expected = hash("secret-token");
        assert!(!token_matches("", &expected));
        assert!(!token_matches("secret", &expected));
        assert!(!token_matches("secret-token-longer", &expected));
        assert!(!token_matches("Secret-Token", &expected));
    }
}

//! Central shared state — passed as `Arc<AppState>` to all Axum handlers.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};

use herald_agent::CostLedger;
use herald_core::config::HeraldConfig;
use herald_core::types::WorkItem;
use herald_sessions::SessionManager;

use crate::rate_limit::RateLimiter;

pub struct AppState {
    pub config: HeraldConfig,
    /// Producer side of the dispatcher queue.
    pub queue: mpsc::Sender<WorkItem>,
    pub sessions: Arc<Mutex<SessionManager>>,
    pub ledger: CostLedger,
    /// SHA-256 of the bearer token, hashed once at startup for constant-time
    /// comparison. `None` = no token configured (protected endpoints 503).
    pub api_token_hash: Option<[u8; 32]>,
    pub started_at: Instant,
    /// 30/min per IP — chat and notify.
    pub chat_limiter: RateLimiter,
    /// 60/min per IP — status, sessions, cost.
    pub status_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        config: HeraldConfig,
        queue: mpsc::Sender<WorkItem>,
        sessions: Arc<Mutex<SessionManager>>,
        ledger: CostLedger,
    ) -> Self {
        let token = config.http_auth_token();
        let api_token_hash = if token.is_empty() {
            None
        } else {
            Some(Sha256::digest(token.as_bytes()).into())
        };
        Self {
            config,
            queue,
            sessions,
            ledger,
            api_token_hash,
            started_at: Instant::now(),
            chat_limiter: RateLimiter::new(30, std::time::Duration::from_secs(60)),
            status_limiter: RateLimiter::new(60, std::time::Duration::from_secs(60)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

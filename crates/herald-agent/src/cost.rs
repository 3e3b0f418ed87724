//! Cost ledger — one SQLite row per provider call.
//!
//! The connection is opened and closed per operation; writes run on the
//! blocking pool so the scheduler threads never wait on SQLite. A failed
//! write is logged and swallowed — spend accounting must never stall the
//! loop.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveTime};
use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use herald_core::types::Usage;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS costs (
        timestamp INTEGER,
        session_id TEXT,
        model TEXT,
        input_tokens INTEGER,
        output_tokens INTEGER,
        cache_read_tokens INTEGER,
        cache_write_tokens INTEGER,
        cost_usd REAL
    )
";

/// Per-model aggregation row for a cost report.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCost {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub period: String,
    pub total_cost: f64,
    pub models: Vec<ModelCost>,
}

#[derive(Debug, Clone)]
pub struct CostLedger {
    path: PathBuf,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the table if needed. Safe to call repeatedly.
    pub fn init(&self) -> rusqlite::Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(&self.path)?;
        conn.execute(SCHEMA, [])?;
        Ok(())
    }

    /// USD cost of one call. `rates` is `[input, output, cache_read]` per
    /// million tokens; missing entries count as zero.
    pub fn compute_cost(usage: Usage, rates: &[f64]) -> f64 {
        let rate = |i: usize| rates.get(i).copied().unwrap_or(0.0);
        usage.input_tokens as f64 * rate(0) / 1_000_000.0
            + usage.output_tokens as f64 * rate(1) / 1_000_000.0
            + usage.cache_read_tokens as f64 * rate(2) / 1_000_000.0
    }

    /// Record one provider call and return its USD cost. Write failures are
    /// logged, never raised.
    pub async fn record(
        &self,
        session_id: &str,
        model: &str,
        usage: Usage,
        rates: &[f64],
    ) -> f64 {
        if rates.is_empty() {
            return 0.0;
        }
        let cost = Self::compute_cost(usage, rates);
        let path = self.path.clone();
        let session_id = session_id.to_string();
        let model = model.to_string();
        let write = tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO costs VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    chrono::Utc::now().timestamp(),
                    session_id,
                    model,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_read_tokens as i64,
                    usage.cache_write_tokens as i64,
                    cost,
                ],
            )?;
            Ok(())
        })
        .await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to record cost"),
            Err(e) => warn!(error = %e, "cost write task failed"),
        }
        cost
    }

    /// Aggregate spend per model over a period: "today" (since local
    /// midnight), "week" (trailing 7 days), or "all".
    pub async fn query(&self, period: &str) -> CostReport {
        let since = match period {
            "today" => today_start_ts(),
            "week" => chrono::Utc::now().timestamp() - 7 * 86_400,
            _ => 0,
        };
        let path = self.path.clone();
        let period = period.to_string();
        let report = tokio::task::spawn_blocking(move || -> rusqlite::Result<CostReport> {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT model,
                        SUM(input_tokens), SUM(output_tokens),
                        SUM(cache_read_tokens), SUM(cache_write_tokens),
                        SUM(cost_usd)
                 FROM costs
                 WHERE timestamp > ?1
                 GROUP BY model
                 ORDER BY SUM(cost_usd) DESC",
            )?;
            let models: Vec<ModelCost> = stmt
                .query_map([since], |row| {
                    Ok(ModelCost {
                        model: row.get(0)?,
                        input_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                        output_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                        cache_read_tokens: row.get::<_, i64>(3)?.max(0) as u64,
                        cache_write_tokens: row.get::<_, i64>(4)?.max(0) as u64,
                        cost_usd: row.get(5)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            let total_cost = models.iter().map(|m| m.cost_usd).sum();
            Ok(CostReport {
                period,
                total_cost,
                models,
            })
        })
        .await;
        match report {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(error = %e, "cost query failed");
                CostReport {
                    period: "error".into(),
                    total_cost: 0.0,
                    models: Vec::new(),
                }
            }
            Err(e) => {
                warn!(error = %e, "cost query task failed");
                CostReport {
                    period: "error".into(),
                    total_cost: 0.0,
                    models: Vec::new(),
                }
            }
        }
    }

    pub async fn today_cost(&self) -> f64 {
        self.query("today").await.total_cost
    }
}

/// Unix timestamp of local midnight today.
fn today_start_ts() -> i64 {
    let midnight = Local::now()
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .single();
    midnight
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| chrono::Utc::now().timestamp() - 86_400)
}

//! Background job: retention cleanup.
//!
//! Runs hourly. Deletes tokens that expired more than the token retention
//! period ago (their token events cascade), deletes api logs older than the
//! log retention period and evicts expired entries from the in-process cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;

use crate::AppState;

/// Spawn the background cleanup task. Call this once at startup.
pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(3600)); // every hour
        loop {
            interval.tick().await;
            if let Err(e) = run_once(&state, Utc::now()).await {
                tracing::error!("cleanup job failed: {}", e);
            }
        }
    });
}

/// Cutoffs for one cleanup pass: `(tokens expired before, logs created before)`.
pub fn retention_cutoffs(
    now: DateTime<Utc>,
    token_retention_days: i64,
    log_retention_days: i64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        now - chrono::Duration::days(token_retention_days.max(0)),
        now - chrono::Duration::days(log_retention_days.max(0)),
    )
}

async fn run_once(state: &AppState, now: DateTime<Utc>) -> anyhow::Result<()> {
    let (token_cutoff, log_cutoff) = retention_cutoffs(
        now,
        state.config.token_retention_days,
        state.config.log_retention_days,
    );

    let tokens = state.db.purge_expired_tokens(token_cutoff).await?;
    if tokens > 0 {
        tracing::info!(rows = tokens, "purged expired tokens");
    }

    let logs = state.db.purge_api_logs(log_cutoff).await?;
    if logs > 0 {
        tracing::info!(rows = logs, "purged old api logs");
    }

    let evicted = state.cache.evict_expired();
    if evicted > 0 {
        tracing::debug!(entries = evicted, "evicted expired cache entries");
    }

    Ok(())
}

//! Retention service for time-based history purge.
//!
//! Runs as a background task deleting subtest results first, then finished
//! sessions older than `retention_days`. Active sessions are never purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task (hourly).
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete finished sessions whose `finished_at` is older than `retention_days`.
///
/// Returns the number of sessions removed.
///
/// # Errors
///
/// Returns `AppError::Db` if a delete fails.
pub async fn purge(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let cutoff_str = cutoff.to_rfc3339();

    sqlx::query(
        "DELETE FROM subtest_result WHERE session_id IN
         (SELECT id FROM qual_session
          WHERE status != 'active' AND finished_at IS NOT NULL AND finished_at < ?1)",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?;

    let removed = sqlx::query(
        "DELETE FROM qual_session
         WHERE status != 'active' AND finished_at IS NOT NULL AND finished_at < ?1",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?
    .rows_affected();

    info!(retention_days, removed, "retention purge completed");
    Ok(removed)
}

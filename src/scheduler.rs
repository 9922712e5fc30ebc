//! Follow-up tick scheduling.
//!
//! A [`Scheduler`] holds at most one pending tick. Arming replaces whatever
//! was pending, so a job never has two follow-ups queued. The pending tick is
//! durable in [`SqliteScheduler`]; something outside the driver (the
//! [`run_trigger_loop`] in `csync serve`, or cron running `csync tick`) has to
//! fire it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::driver::{StartOutcome, SyncDriver};
use crate::error::SyncError;

const BATCH_HOOK: &str = "catalog_sync_batch";

/// A queued follow-up tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTick {
    pub job_id: Uuid,
    pub due_at: DateTime<Utc>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Queue one tick for `job_id` after `delay`, replacing any pending tick.
    async fn arm(&self, delay: Duration, job_id: Uuid) -> Result<()>;

    async fn disarm(&self) -> Result<()>;

    async fn pending(&self) -> Result<Option<PendingTick>>;

    /// Remove and return the pending tick if it is due at `now`.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Option<PendingTick>>;
}

pub struct SqliteScheduler {
    pool: SqlitePool,
}

impl SqliteScheduler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn due_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn tick_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PendingTick> {
    let job_id: String = row.try_get("job_id")?;
    let due_ms: i64 = row.try_get("due_at")?;
    Ok(PendingTick {
        job_id: Uuid::parse_str(&job_id)?,
        due_at: DateTime::from_timestamp_millis(due_ms).unwrap_or_default(),
    })
}

#[async_trait]
impl Scheduler for SqliteScheduler {
    async fn arm(&self, delay: Duration, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_ticks (hook, job_id, due_at) VALUES (?, ?, ?)
            ON CONFLICT(hook) DO UPDATE SET job_id = excluded.job_id, due_at = excluded.due_at
            "#,
        )
        .bind(BATCH_HOOK)
        .bind(job_id.to_string())
        .bind(due_at(Utc::now(), delay).timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_ticks WHERE hook = ?")
            .bind(BATCH_HOOK)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Option<PendingTick>> {
        let row = sqlx::query("SELECT job_id, due_at FROM scheduled_ticks WHERE hook = ?")
            .bind(BATCH_HOOK)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tick_from_row).transpose()
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Option<PendingTick>> {
        let row = sqlx::query(
            "DELETE FROM scheduled_ticks WHERE hook = ? AND due_at <= ? RETURNING job_id, due_at",
        )
        .bind(BATCH_HOOK)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tick_from_row).transpose()
    }
}

/// Fire due ticks and start a sync every `frequency` until the task is dropped.
///
/// Errors are logged and the loop keeps going; a failed tick has already
/// recorded its failure on the job.
pub async fn run_trigger_loop(driver: Arc<SyncDriver>, poll: Duration, frequency: Duration) {
    let mut interval = tokio::time::interval(poll);
    let mut next_periodic = tokio::time::Instant::now();

    loop {
        interval.tick().await;

        match driver.fire_due_tick(Utc::now()).await {
            Ok(Some(outcome)) => info!(?outcome, "tick fired"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "tick failed"),
        }

        if tokio::time::Instant::now() >= next_periodic {
            next_periodic = tokio::time::Instant::now() + frequency;
            match driver.start_sync().await {
                Ok(StartOutcome::AlreadyRunning(handle)) => {
                    info!(job_id = %handle.id, "periodic sync skipped, job already running")
                }
                Ok(outcome) => info!(?outcome, "periodic sync started"),
                Err(SyncError::Configuration(reason)) => {
                    info!(%reason, "periodic sync skipped")
                }
                Err(e) => warn!(error = %e, "periodic sync failed"),
            }
        }
    }
}

//! Durable progress of the background job.
//!
//! The store holds at most one [`SyncJob`]. Saves are compare-and-swap on
//! [`SyncJob::version`]: a save whose version no longer matches the stored
//! one returns `None` and writes nothing. The store also keeps the last
//! [`SyncOutcome`] so status can be reported when no job is active.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::ts_to_datetime;
use crate::models::{SyncJob, SyncOutcome};

const OUTCOME_KEY: &str = "last_outcome";

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self) -> Result<Option<SyncJob>>;

    /// Compare-and-swap save. Returns the stored job with its bumped version,
    /// or `None` when another writer saved first.
    async fn save(&self, job: &SyncJob) -> Result<Option<SyncJob>>;

    async fn clear(&self) -> Result<()>;

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<()>;

    async fn last_outcome(&self) -> Result<Option<SyncOutcome>>;
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(SyncJob {
        id: Uuid::parse_str(&id).context("Invalid job id in sync_job")?,
        total: row.try_get::<i64, _>("total")? as u64,
        processed: row.try_get::<i64, _>("processed")? as u64,
        batch_index: row.try_get::<i64, _>("batch_index")? as u64,
        rejected: row.try_get::<i64, _>("rejected")? as u64,
        status: status.parse()?,
        started_at: ts_to_datetime(row.try_get("started_at")?),
        updated_at: ts_to_datetime(row.try_get("updated_at")?),
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load(&self) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_job WHERE slot = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn save(&self, job: &SyncJob) -> Result<Option<SyncJob>> {
        let result = if job.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO sync_job (slot, id, total, processed, batch_index, rejected, status, started_at, updated_at, last_error, version)
                VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                ON CONFLICT(slot) DO NOTHING
                "#,
            )
            .bind(job.id.to_string())
            .bind(job.total as i64)
            .bind(job.processed as i64)
            .bind(job.batch_index as i64)
            .bind(job.rejected as i64)
            .bind(job.status.as_str())
            .bind(job.started_at.timestamp())
            .bind(job.updated_at.timestamp())
            .bind(&job.last_error)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE sync_job SET
                    id = ?, total = ?, processed = ?, batch_index = ?, rejected = ?,
                    status = ?, started_at = ?, updated_at = ?, last_error = ?,
                    version = version + 1
                WHERE slot = 1 AND version = ?
                "#,
            )
            .bind(job.id.to_string())
            .bind(job.total as i64)
            .bind(job.processed as i64)
            .bind(job.batch_index as i64)
            .bind(job.rejected as i64)
            .bind(job.status.as_str())
            .bind(job.started_at.timestamp())
            .bind(job.updated_at.timestamp())
            .bind(&job.last_error)
            .bind(job.version)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            Ok(Some(SyncJob {
                version: job.version + 1,
                ..job.clone()
            }))
        } else {
            Ok(None)
        }
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_job").execute(&self.pool).await?;
        Ok(())
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(OUTCOME_KEY)
        .bind(serde_json::to_string(outcome)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_outcome(&self) -> Result<Option<SyncOutcome>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
                .bind(OUTCOME_KEY)
                .fetch_optional(&self.pool)
                .await?;
        match value {
            Some(v) => Ok(Some(
                serde_json::from_str(&v).context("Corrupt last outcome in sync_state")?,
            )),
            None => Ok(None),
        }
    }
}

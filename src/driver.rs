//! The sync state machine.
//!
//! [`SyncDriver`] decides between a direct run (everything inside one call)
//! and a background job advanced one batch per externally triggered tick.
//!
//! # Batch algorithm
//!
//! At `offset = batch_index * batch_size` against the run's snapshot:
//!
//! 1. Select a page. An empty page finishes the run.
//! 2. Map every item; validation failures are logged and left out.
//! 3. Bulk-sync the valid records. A remote failure aborts the batch and,
//!    for a background job, fails the job.
//! 4. Mark every selected item, rejected ones included, for the current run.
//! 5. Advance `processed` by the rows scanned and `batch_index` by one.
//!
//! A batch that scans fewer rows than `batch_size`, or brings `processed` up
//! to `total`, finishes the run in the same call.
//!
//! # Concurrency
//!
//! Background state lives only in the [`JobStore`]. Every tick claims the job
//! with a compare-and-swap save before touching the catalog; a tick that
//! loses a race reports [`TickOutcome::Conflict`] and does nothing else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::{Config, SyncConfig};
use crate::db;
use crate::error::{SyncError, ValidationError};
use crate::gateway::{Ack, ApiGateway, HttpGateway};
use crate::job_store::{JobStore, SqliteJobStore};
use crate::mapper::{EntityMapper, MappingHook};
use crate::migrate;
use crate::models::{
    CatalogStats, JobHandle, JobStatus, MappedImage, MappedRecord, RecordStatus, SyncJob,
    SyncOutcome,
};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::scheduler::{PendingTick, Scheduler, SqliteScheduler};
use crate::selector::{EligibilityPredicate, Snapshot, StalenessSelector};

/// External id used by [`SyncDriver::check_connection`].
pub const TEST_RECORD_ID: &str = "test-connection";

/// Result of [`SyncDriver::start_sync`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    NothingToSync,
    /// A direct run finished inside the call.
    Completed(SyncSummary),
    /// A background job was created and its first tick armed.
    Started(JobHandle),
    /// A job was already running; nothing new was created.
    AlreadyRunning(JobHandle),
}

/// Summary of a finished direct run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub total: u64,
    pub processed: u64,
    pub synced: u64,
    pub rejected: u64,
    pub batches: u64,
    pub elapsed_secs: f64,
    pub message: String,
}

/// Result of [`SyncDriver::process_next_batch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum TickOutcome {
    /// No running job; the tick was stale.
    Idle,
    /// Another writer changed the job first; this tick did nothing more.
    Conflict,
    /// One batch done, another tick armed.
    Advanced(SyncJob),
    Completed(SyncJob),
    Failed(SyncJob),
}

/// Result of [`SyncDriver::sync_item`].
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSyncOutcome {
    Synced { external_id: String },
    Disabled,
    NotFound,
    Ineligible,
    Rejected(Vec<ValidationError>),
}

/// Snapshot returned by [`SyncDriver::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: JobStatus,
    pub message: String,
    pub job: Option<SyncJob>,
    pub last_outcome: Option<SyncOutcome>,
    pub next_tick_at: Option<DateTime<Utc>>,
}

struct BatchResult {
    scanned: u64,
    sent: usize,
    rejected: usize,
}

pub struct SyncDriver {
    settings: SyncConfig,
    catalog: Arc<dyn Catalog>,
    selector: StalenessSelector,
    mapper: EntityMapper,
    store: Arc<dyn JobStore>,
    scheduler: Arc<dyn Scheduler>,
    gateway: Result<Arc<dyn ApiGateway>, String>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncDriver {
    pub fn new(
        settings: SyncConfig,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn Scheduler>,
        gateway: Arc<dyn ApiGateway>,
    ) -> Self {
        Self::assemble(settings, catalog, store, scheduler, Ok(gateway))
    }

    fn assemble(
        settings: SyncConfig,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn Scheduler>,
        gateway: Result<Arc<dyn ApiGateway>, String>,
    ) -> Self {
        let selector = StalenessSelector::new(
            catalog.clone(),
            settings.categories.clone(),
            chrono::Duration::seconds(settings.staleness_secs),
        );
        let mapper = EntityMapper::new(settings.tenant.clone(), settings.currency.clone());
        Self {
            settings,
            catalog,
            selector,
            mapper,
            store,
            scheduler,
            gateway,
            progress: Arc::new(NoProgress),
        }
    }

    /// SQLite-backed driver talking HTTP to `[remote]`.
    ///
    /// A missing endpoint or credential does not fail here; it is reported
    /// as a configuration error by the operations that need the remote.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let gateway = HttpGateway::new(&config.remote)
            .map(|g| Arc::new(g) as Arc<dyn ApiGateway>)
            .map_err(|e| match e {
                SyncError::Configuration(reason) => reason,
                other => other.to_string(),
            });

        Ok(Self::assemble(
            config.sync.clone(),
            Arc::new(SqliteCatalog::new(pool.clone())),
            Arc::new(SqliteJobStore::new(pool.clone())),
            Arc::new(SqliteScheduler::new(pool)),
            gateway,
        ))
    }

    pub fn with_hook(mut self, hook: MappingHook) -> Self {
        self.mapper = self.mapper.with_hook(hook);
        self
    }

    pub fn with_eligibility(mut self, predicate: EligibilityPredicate) -> Self {
        self.selector = self.selector.with_eligibility(predicate);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn batch_size(&self) -> u64 {
        self.settings.batch_size as u64
    }

    /// Remote gateway, if endpoint and credential are configured.
    fn configured_gateway(&self) -> Result<Arc<dyn ApiGateway>, SyncError> {
        self.gateway
            .as_ref()
            .map(Arc::clone)
            .map_err(|reason| SyncError::configuration(reason.clone()))
    }

    /// Gateway for sync operations: also requires sync to be enabled.
    fn sync_gateway(&self) -> Result<Arc<dyn ApiGateway>, SyncError> {
        if !self.settings.enabled {
            return Err(SyncError::configuration("sync is disabled"));
        }
        self.configured_gateway()
    }

    async fn record(&self, message: String, last_error: Option<String>) -> anyhow::Result<()> {
        self.store
            .record_outcome(&SyncOutcome {
                message,
                last_error,
                at: Utc::now(),
            })
            .await
    }

    /// Begin a sync run.
    ///
    /// Returns the running job's handle if one exists. Below the direct
    /// threshold every batch runs inside this call.
    pub async fn start_sync(&self) -> Result<StartOutcome, SyncError> {
        let gateway = self.sync_gateway()?;

        let existing = self.store.load().await?;
        if let Some(job) = existing.as_ref().filter(|j| j.is_running()) {
            debug!(job_id = %job.id, "sync already running");
            return Ok(StartOutcome::AlreadyRunning(job.handle()));
        }

        let run_id = Uuid::new_v4();
        let snapshot = Snapshot {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
        };
        let total = self.selector.count_all(&snapshot).await?;

        if total == 0 {
            info!("no items to sync");
            self.record("No items to sync".to_string(), None).await?;
            return Ok(StartOutcome::NothingToSync);
        }

        if total < self.settings.direct_threshold {
            return self
                .run_direct(gateway.as_ref(), run_id, snapshot, total)
                .await;
        }

        let version = existing.map(|j| j.version).unwrap_or(0);
        let job = SyncJob::start(run_id, total, snapshot.started_at, version);

        let Some(saved) = self.store.save(&job).await? else {
            // Someone else started a job between our load and save
            return match self.store.load().await? {
                Some(job) if job.is_running() => Ok(StartOutcome::AlreadyRunning(job.handle())),
                _ => Err(SyncError::Conflict),
            };
        };

        self.scheduler.arm(self.tick_delay(), saved.id).await?;
        info!(job_id = %saved.id, total, "background sync started");
        self.progress.report(SyncProgressEvent::Started {
            total,
            background: true,
        });
        self.record(format!("Sync started: {} items queued", total), None)
            .await?;
        Ok(StartOutcome::Started(saved.handle()))
    }

    fn tick_delay(&self) -> Duration {
        Duration::from_secs(self.settings.tick_delay_secs)
    }

    async fn run_direct(
        &self,
        gateway: &dyn ApiGateway,
        run_id: Uuid,
        snapshot: Snapshot,
        total: u64,
    ) -> Result<StartOutcome, SyncError> {
        let started = Instant::now();
        info!(run_id = %run_id, total, "direct sync started");
        self.progress.report(SyncProgressEvent::Started {
            total,
            background: false,
        });

        let batch_size = self.batch_size();
        let delay = Duration::from_millis(self.settings.batch_delay_ms);
        let (mut processed, mut batch_index, mut synced, mut rejected) = (0u64, 0u64, 0u64, 0u64);

        loop {
            let result = match self
                .run_batch(gateway, &snapshot, batch_index * batch_size)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id = %run_id, batch_index, error = %e, "direct sync failed");
                    self.record(format!("Sync failed: {}", e), Some(e.to_string()))
                        .await?;
                    return Err(e);
                }
            };
            if result.scanned == 0 {
                break;
            }

            processed = (processed + result.scanned).min(total);
            synced += result.sent as u64;
            rejected += result.rejected as u64;
            self.progress.report(SyncProgressEvent::Batch {
                batch_index,
                sent: result.sent,
                rejected: result.rejected,
                processed,
                total,
            });
            batch_index += 1;

            if result.scanned < batch_size || processed >= total {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        let message = summary_message(synced, rejected, elapsed);
        info!(run_id = %run_id, synced, rejected, batches = batch_index, "direct sync completed");
        self.progress.report(SyncProgressEvent::Finished {
            processed,
            elapsed_secs: elapsed,
        });
        self.record(message.clone(), None).await?;

        Ok(StartOutcome::Completed(SyncSummary {
            run_id,
            total,
            processed,
            synced,
            rejected,
            batches: batch_index,
            elapsed_secs: elapsed,
            message,
        }))
    }

    async fn run_batch(
        &self,
        gateway: &dyn ApiGateway,
        snapshot: &Snapshot,
        offset: u64,
    ) -> Result<BatchResult, SyncError> {
        let page = self
            .selector
            .select(snapshot, offset, self.batch_size())
            .await?;
        if page.scanned == 0 {
            return Ok(BatchResult {
                scanned: 0,
                sent: 0,
                rejected: 0,
            });
        }

        let mut records = Vec::with_capacity(page.items.len());
        let mut rejected = 0;
        for item in &page.items {
            match self.mapper.map(item) {
                Ok(record) => records.push(record),
                Err(errors) => {
                    rejected += 1;
                    let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                    warn!(item_id = item.id, errors = ?reasons, "item failed validation");
                }
            }
        }

        if !records.is_empty() {
            gateway.bulk_sync(&records).await?;
        }

        let ids: Vec<i64> = page.items.iter().map(|i| i.id).collect();
        self.catalog
            .mark_synced(&ids, Utc::now(), Some(&snapshot.run_id))
            .await?;

        debug!(offset, scanned = page.scanned, sent = records.len(), rejected, "batch done");
        Ok(BatchResult {
            scanned: page.scanned,
            sent: records.len(),
            rejected,
        })
    }

    /// Advance the background job by one batch.
    pub async fn process_next_batch(&self) -> Result<TickOutcome, SyncError> {
        let Some(job) = self.store.load().await? else {
            return Ok(TickOutcome::Idle);
        };
        if !job.is_running() {
            debug!(job_id = %job.id, status = %job.status, "stale tick");
            return Ok(TickOutcome::Idle);
        }

        let mut claim = job.clone();
        claim.updated_at = Utc::now();
        let Some(mut job) = self.store.save(&claim).await? else {
            debug!(job_id = %claim.id, "tick lost the claim");
            return Ok(TickOutcome::Conflict);
        };

        let gateway = match self.sync_gateway() {
            Ok(gateway) => gateway,
            Err(e) => {
                self.fail_job(job, e.to_string()).await?;
                return Err(e);
            }
        };

        let snapshot = Snapshot {
            run_id: job.id.to_string(),
            started_at: job.started_at,
        };
        let result = match self
            .run_batch(gateway.as_ref(), &snapshot, job.batch_index * self.batch_size())
            .await
        {
            Ok(result) => result,
            Err(e) => return self.fail_job(job, e.to_string()).await,
        };

        job.processed = (job.processed + result.scanned).min(job.total);
        job.rejected += result.rejected as u64;
        if result.scanned > 0 {
            self.progress.report(SyncProgressEvent::Batch {
                batch_index: job.batch_index,
                sent: result.sent,
                rejected: result.rejected,
                processed: job.processed,
                total: job.total,
            });
            job.batch_index += 1;
        }
        let finished = result.scanned < self.batch_size() || job.processed >= job.total;
        if finished {
            job.status = JobStatus::Completed;
        }
        job.updated_at = Utc::now();

        let Some(job) = self.store.save(&job).await? else {
            debug!(job_id = %job.id, "job changed during batch");
            return Ok(TickOutcome::Conflict);
        };

        if finished {
            self.scheduler.disarm().await?;
            let elapsed = (job.updated_at - job.started_at).num_milliseconds() as f64 / 1000.0;
            let synced = job.processed.saturating_sub(job.rejected);
            info!(job_id = %job.id, processed = job.processed, rejected = job.rejected, "background sync completed");
            self.progress.report(SyncProgressEvent::Finished {
                processed: job.processed,
                elapsed_secs: elapsed,
            });
            self.record(summary_message(synced, job.rejected, elapsed), None)
                .await?;
            Ok(TickOutcome::Completed(job))
        } else {
            self.scheduler.arm(self.tick_delay(), job.id).await?;
            debug!(job_id = %job.id, processed = job.processed, total = job.total, "tick armed");
            Ok(TickOutcome::Advanced(job))
        }
    }

    async fn fail_job(&self, mut job: SyncJob, error: String) -> Result<TickOutcome, SyncError> {
        warn!(job_id = %job.id, batch_index = job.batch_index, error = %error, "background sync failed");
        job.status = JobStatus::Failed;
        job.last_error = Some(error.clone());
        job.updated_at = Utc::now();

        let Some(job) = self.store.save(&job).await? else {
            return Ok(TickOutcome::Conflict);
        };
        self.scheduler.disarm().await?;
        self.record(format!("Sync failed: {}", error), Some(error))
            .await?;
        Ok(TickOutcome::Failed(job))
    }

    /// Take the pending tick if it is due at `now` and run it.
    pub async fn fire_due_tick(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<TickOutcome>, SyncError> {
        match self.scheduler.take_due(now).await? {
            Some(tick) => {
                debug!(job_id = %tick.job_id, "firing due tick");
                match self.process_next_batch().await {
                    Ok(outcome) => Ok(Some(outcome)),
                    Err(e) => {
                        if let Err(rearm) = self.rearm_orphaned().await {
                            warn!(error = %rearm, "could not re-arm after failed tick");
                        }
                        Err(e)
                    }
                }
            }
            None => {
                self.rearm_orphaned().await?;
                Ok(None)
            }
        }
    }

    /// Arm a tick for a running job that has none pending.
    ///
    /// A tick that dies between taking its schedule entry and arming the
    /// next one leaves the job stranded; this puts it back on the schedule.
    /// Returns whether a tick was armed.
    pub async fn rearm_orphaned(&self) -> Result<bool, SyncError> {
        let Some(job) = self.store.load().await?.filter(|j| j.is_running()) else {
            return Ok(false);
        };
        if self.scheduler.pending().await?.is_some() {
            return Ok(false);
        }
        warn!(job_id = %job.id, processed = job.processed, "running job had no pending tick, re-arming");
        self.scheduler.arm(self.tick_delay(), job.id).await?;
        Ok(true)
    }

    pub async fn get_status(&self) -> Result<SyncStatus, SyncError> {
        let job = self.store.load().await?;
        let last_outcome = self.store.last_outcome().await?;
        let pending: Option<PendingTick> = self.scheduler.pending().await?;

        let (state, message) = match &job {
            Some(job) if job.is_running() => (
                JobStatus::Running,
                format!(
                    "Sync in progress: {} / {} items ({}%)",
                    job.processed,
                    job.total,
                    percent(job.processed, job.total)
                ),
            ),
            Some(job) => (
                job.status,
                last_outcome
                    .as_ref()
                    .map(|o| o.message.clone())
                    .unwrap_or_else(|| job.status.to_string()),
            ),
            None => (
                JobStatus::Idle,
                last_outcome
                    .as_ref()
                    .map(|o| o.message.clone())
                    .unwrap_or_else(|| "Never synced".to_string()),
            ),
        };

        Ok(SyncStatus {
            state,
            message,
            job,
            last_outcome,
            next_tick_at: pending.map(|p| p.due_at),
        })
    }

    /// Move a running job to Failed. Returns the cancelled job, or `None`
    /// when nothing was running.
    pub async fn cancel(&self) -> Result<Option<SyncJob>, SyncError> {
        let Some(mut job) = self.store.load().await?.filter(|j| j.is_running()) else {
            return Ok(None);
        };
        job.status = JobStatus::Failed;
        job.last_error = Some("cancelled".to_string());
        job.updated_at = Utc::now();

        let saved = self.store.save(&job).await?.ok_or(SyncError::Conflict)?;
        self.scheduler.disarm().await?;
        self.record("Sync cancelled".to_string(), Some("cancelled".to_string()))
            .await?;
        info!(job_id = %saved.id, "sync cancelled");
        Ok(Some(saved))
    }

    /// Forget the job record and any pending tick.
    pub async fn reset(&self) -> Result<(), SyncError> {
        self.store.clear().await?;
        self.scheduler.disarm().await?;
        info!("sync state reset");
        Ok(())
    }

    /// Push one item immediately, e.g. after it changed in the catalog.
    pub async fn sync_item(&self, item_id: i64) -> Result<ItemSyncOutcome, SyncError> {
        if !self.settings.enabled {
            return Ok(ItemSyncOutcome::Disabled);
        }
        let gateway = self.configured_gateway()?;

        let Some(item) = self.catalog.get_item(item_id).await? else {
            return Ok(ItemSyncOutcome::NotFound);
        };
        if !self.selector.is_eligible(&item) {
            debug!(item_id, "item not eligible for sync");
            return Ok(ItemSyncOutcome::Ineligible);
        }

        let record = match self.mapper.map(&item) {
            Ok(record) => record,
            Err(errors) => {
                warn!(item_id, count = errors.len(), "item failed validation");
                return Ok(ItemSyncOutcome::Rejected(errors));
            }
        };
        gateway.sync_one(&record).await?;

        // Only a candidate of the running job may carry its run id; tagging
        // any other item would shift the job's offsets.
        let run = self
            .store
            .load()
            .await?
            .filter(|j| j.is_running())
            .map(|j| Snapshot {
                run_id: j.id.to_string(),
                started_at: j.started_at,
            })
            .filter(|snapshot| self.selector.in_snapshot(snapshot, &item))
            .map(|snapshot| snapshot.run_id);
        self.catalog
            .mark_synced(&[item_id], Utc::now(), run.as_deref())
            .await?;

        info!(item_id, external_id = %record.external_id, "item synced");
        Ok(ItemSyncOutcome::Synced {
            external_id: record.external_id,
        })
    }

    pub fn external_id_for(&self, item_id: i64) -> String {
        self.mapper.external_id(item_id)
    }

    /// Remove one record from the remote service.
    pub async fn delete_item(&self, external_id: &str) -> Result<Ack, SyncError> {
        let gateway = self.sync_gateway()?;
        let ack = gateway.delete(&[external_id.to_string()]).await?;
        info!(%external_id, "record deleted");
        Ok(ack)
    }

    /// Round-trip a throwaway record to verify endpoint and credential.
    ///
    /// Works while sync is disabled.
    pub async fn check_connection(&self) -> Result<(), SyncError> {
        let gateway = self.configured_gateway()?;
        let record = MappedRecord {
            external_id: TEST_RECORD_ID.to_string(),
            name: "Connection Test".to_string(),
            description: "Connection test record".to_string(),
            price: Some(0.0),
            currency: self.settings.currency.clone(),
            sku: TEST_RECORD_ID.to_string(),
            categories: Vec::new(),
            images: Vec::<MappedImage>::new(),
            attributes: Default::default(),
            stock: None,
            status: RecordStatus::Draft,
            metadata: serde_json::json!({ "test": true }),
        };
        gateway.sync_one(&record).await?;
        gateway.delete(&[TEST_RECORD_ID.to_string()]).await?;
        info!("remote connection verified");
        Ok(())
    }

    pub async fn stats(&self) -> Result<CatalogStats, SyncError> {
        let stale_before = Utc::now() - self.selector.window();
        Ok(self.catalog.stats(stale_before).await?)
    }
}

fn summary_message(synced: u64, rejected: u64, elapsed_secs: f64) -> String {
    let mut message = format!("Synced {} items in {:.1}s", synced, elapsed_secs);
    if rejected > 0 {
        message.push_str(&format!(" ({} rejected)", rejected));
    }
    message
}

fn percent(processed: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    processed * 100 / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_rejections_only_when_present() {
        assert_eq!(summary_message(3, 0, 0.04), "Synced 3 items in 0.0s");
        assert_eq!(
            summary_message(48, 2, 1.26),
            "Synced 48 items in 1.3s (2 rejected)"
        );
    }

    #[test]
    fn percent_handles_empty_total() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(600, 1200), 50);
    }
}

//! In-memory implementations of the engine's seams.
//!
//! Used by tests and by embedders that keep their catalog elsewhere.
//! [`RecordingGateway`] records every call and can be told to fail.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::catalog::{CandidateQuery, Catalog};
use crate::error::RemoteError;
use crate::gateway::{Ack, ApiGateway};
use crate::job_store::JobStore;
use crate::models::{CatalogItem, CatalogStats, MappedRecord, SyncJob, SyncOutcome};
use crate::scheduler::{PendingTick, Scheduler};

struct StoredItem {
    item: CatalogItem,
    run_id: Option<String>,
}

/// Catalog held in a vector, kept sorted by id.
#[derive(Default)]
pub struct MemoryCatalog {
    items: Mutex<Vec<StoredItem>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id.
    pub fn insert(&self, item: CatalogItem) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        match items.binary_search_by_key(&item.id, |s| s.item.id) {
            Ok(pos) => items[pos].item = item,
            Err(pos) => items.insert(pos, StoredItem { item, run_id: None }),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every item, in id order.
    pub fn items(&self) -> Vec<CatalogItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.item.clone())
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items
            .iter()
            .filter(|s| query.matches(&s.item, s.run_id.as_deref()))
            .count() as u64)
    }

    async fn candidates(
        &self,
        query: &CandidateQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items
            .iter()
            .filter(|s| query.matches(&s.item, s.run_id.as_deref()))
            .skip(offset as usize)
            .take(limit as usize)
            .map(|s| s.item.clone())
            .collect())
    }

    async fn get_item(&self, id: i64) -> Result<Option<CatalogItem>> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items
            .binary_search_by_key(&id, |s| s.item.id)
            .ok()
            .map(|pos| items[pos].item.clone()))
    }

    async fn mark_synced(
        &self,
        ids: &[i64],
        at: DateTime<Utc>,
        run_id: Option<&str>,
    ) -> Result<()> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        for stored in items.iter_mut().filter(|s| ids.contains(&s.item.id)) {
            stored.item.last_synced_at = Some(at);
            if let Some(run) = run_id {
                stored.run_id = Some(run.to_string());
            }
        }
        Ok(())
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<CatalogStats> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = CatalogStats::default();
        for s in items.iter().filter(|s| s.item.status.is_publishable()) {
            stats.published += 1;
            match s.item.last_synced_at {
                Some(at) => {
                    stats.synced += 1;
                    if at < stale_before {
                        stats.stale += 1;
                    }
                }
                None => {
                    stats.pending += 1;
                    stats.stale += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// Job store with the same compare-and-swap contract as the SQLite one.
#[derive(Default)]
pub struct MemoryJobStore {
    job: Mutex<Option<SyncJob>>,
    outcome: Mutex<Option<SyncOutcome>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self) -> Result<Option<SyncJob>> {
        Ok(self.job.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, job: &SyncJob) -> Result<Option<SyncJob>> {
        let mut slot = self.job.lock().unwrap_or_else(|e| e.into_inner());
        let current = slot.as_ref().map(|j| j.version).unwrap_or(0);
        if current != job.version {
            return Ok(None);
        }
        let saved = SyncJob {
            version: job.version + 1,
            ..job.clone()
        };
        *slot = Some(saved.clone());
        Ok(Some(saved))
    }

    async fn clear(&self) -> Result<()> {
        *self.job.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<()> {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome.clone());
        Ok(())
    }

    async fn last_outcome(&self) -> Result<Option<SyncOutcome>> {
        Ok(self.outcome.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Scheduler that only remembers the pending tick and counts arms.
#[derive(Default)]
pub struct MemoryScheduler {
    pending: Mutex<Option<PendingTick>>,
    arms: Mutex<u64>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `arm` calls so far.
    pub fn armed_count(&self) -> u64 {
        *self.arms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn arm(&self, delay: Duration, job_id: Uuid) -> Result<()> {
        let due_at = Utc::now() + chrono::Duration::from_std(delay)?;
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(PendingTick { job_id, due_at });
        *self.arms.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn pending(&self) -> Result<Option<PendingTick>> {
        Ok(*self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Option<PendingTick>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let due = matches!(*pending, Some(tick) if tick.due_at <= now);
        Ok(if due { pending.take() } else { None })
    }
}

#[derive(Default)]
struct GatewayLog {
    bulk_calls: usize,
    batches: Vec<Vec<MappedRecord>>,
    singles: Vec<MappedRecord>,
    deleted: Vec<Vec<String>>,
}

/// Gateway that records what it was sent.
///
/// `fail_on_bulk_call(n)` makes the n-th bulk call (1-based) fail with
/// HTTP 500; failed calls are not recorded as batches.
#[derive(Default)]
pub struct RecordingGateway {
    log: Mutex<GatewayLog>,
    fail_on: Option<usize>,
    fail_all: bool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_bulk_call(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::default()
        }
    }

    /// Every call fails.
    pub fn unreachable() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<MappedRecord>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).batches.clone()
    }

    pub fn singles(&self) -> Vec<MappedRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).singles.clone()
    }

    pub fn deleted(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).deleted.clone()
    }

    fn unavailable() -> RemoteError {
        RemoteError::http(500, "Service unavailable")
    }
}

#[async_trait]
impl ApiGateway for RecordingGateway {
    async fn bulk_sync(&self, records: &[MappedRecord]) -> Result<Ack, RemoteError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.bulk_calls += 1;
        if self.fail_all || self.fail_on == Some(log.bulk_calls) {
            return Err(Self::unavailable());
        }
        log.batches.push(records.to_vec());
        Ok(Ack {
            status: 200,
            body: json!({ "success": true, "synced": records.len() }),
        })
    }

    async fn sync_one(&self, record: &MappedRecord) -> Result<Ack, RemoteError> {
        if self.fail_all {
            return Err(Self::unavailable());
        }
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.singles.push(record.clone());
        Ok(Ack {
            status: 200,
            body: json!({ "success": true }),
        })
    }

    async fn delete(&self, external_ids: &[String]) -> Result<Ack, RemoteError> {
        if self.fail_all {
            return Err(Self::unavailable());
        }
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.deleted.push(external_ids.to_vec());
        Ok(Ack {
            status: 200,
            body: json!({ "success": true }),
        })
    }
}

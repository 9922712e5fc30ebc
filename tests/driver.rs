use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use catalog_sync::catalog::{Catalog, SqliteCatalog};
use catalog_sync::config::{Config, SyncConfig};
use catalog_sync::driver::{ItemSyncOutcome, StartOutcome, SyncDriver, TickOutcome};
use catalog_sync::error::SyncError;
use catalog_sync::job_store::{JobStore, SqliteJobStore};
use catalog_sync::mapper::MappingHook;
use catalog_sync::memory::{MemoryCatalog, MemoryJobStore, MemoryScheduler, RecordingGateway};
use catalog_sync::models::{
    CatalogItem, ItemCategory, ItemImage, JobStatus, MappedRecord, PublishStatus, SyncJob,
    SyncOutcome,
};
use catalog_sync::scheduler::{Scheduler, SqliteScheduler};
use catalog_sync::selector::EligibilityPredicate;
use catalog_sync::{db, migrate};
use tempfile::TempDir;

fn settings() -> SyncConfig {
    SyncConfig {
        enabled: true,
        batch_delay_ms: 0,
        tick_delay_secs: 0,
        ..SyncConfig::default()
    }
}

fn priced(id: i64) -> CatalogItem {
    let mut item = CatalogItem::new(id, format!("Item {}", id));
    item.price = Some("19.99".into());
    item.images.push(ItemImage {
        url: format!("https://cdn.example.com/{}.jpg", id),
        alt: String::new(),
    });
    item.categories.push(ItemCategory {
        id: 10,
        name: "Lamps".into(),
        slug: "lamps".into(),
    });
    item
}

struct Harness {
    catalog: Arc<MemoryCatalog>,
    store: Arc<MemoryJobStore>,
    scheduler: Arc<MemoryScheduler>,
    gateway: Arc<RecordingGateway>,
    driver: SyncDriver,
}

fn harness_with(settings: SyncConfig, count: i64, gateway: RecordingGateway) -> Harness {
    let catalog = Arc::new(MemoryCatalog::new());
    for id in 1..=count {
        catalog.insert(priced(id));
    }
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = Arc::new(MemoryScheduler::new());
    let gateway = Arc::new(gateway);
    let driver = SyncDriver::new(
        settings,
        catalog.clone(),
        store.clone(),
        scheduler.clone(),
        gateway.clone(),
    );
    Harness {
        catalog,
        store,
        scheduler,
        gateway,
        driver,
    }
}

fn harness(count: i64) -> Harness {
    harness_with(settings(), count, RecordingGateway::new())
}

fn synced_ids(catalog: &MemoryCatalog) -> Vec<i64> {
    catalog
        .items()
        .iter()
        .filter(|i| i.last_synced_at.is_some())
        .map(|i| i.id)
        .collect()
}

#[tokio::test]
async fn small_catalog_syncs_directly() {
    let h = harness(3);

    let outcome = h.driver.start_sync().await.unwrap();
    let StartOutcome::Completed(summary) = outcome else {
        panic!("expected a direct run, got {:?}", outcome);
    };
    assert_eq!(summary.total, 3);
    assert_eq!(summary.synced, 3);
    assert_eq!(summary.batches, 1);
    assert!(summary.message.contains('3'));

    let batches = h.gateway.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert_eq!(synced_ids(&h.catalog), vec![1, 2, 3]);

    // Direct runs never persist a job
    assert!(h.store.load().await.unwrap().is_none());
    let status = h.driver.get_status().await.unwrap();
    assert_eq!(status.state, JobStatus::Idle);
    assert!(status.message.contains("Synced 3"));
}

#[tokio::test]
async fn large_catalog_runs_in_background_ticks() {
    let h = harness(1200);

    let outcome = h.driver.start_sync().await.unwrap();
    let StartOutcome::Started(handle) = outcome else {
        panic!("expected a background job, got {:?}", outcome);
    };
    assert_eq!(handle.total, 1200);
    assert_eq!(h.scheduler.armed_count(), 1);
    assert_eq!(
        h.scheduler.pending().await.unwrap().unwrap().job_id,
        handle.id
    );
    let job = h.store.load().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.processed, 0);
    assert!(h.gateway.batches().is_empty());

    for tick in 1..=24 {
        let outcome = h.driver.process_next_batch().await.unwrap();
        match outcome {
            TickOutcome::Advanced(job) if tick < 24 => {
                assert_eq!(job.processed, tick * 50);
                assert_eq!(job.batch_index, tick);
            }
            TickOutcome::Completed(job) if tick == 24 => {
                assert_eq!(job.processed, 1200);
                assert_eq!(job.batch_index, 24);
            }
            other => panic!("unexpected outcome at tick {}: {:?}", tick, other),
        }
    }

    let job = h.store.load().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed, job.total);
    assert_eq!(h.scheduler.armed_count(), 24);
    assert!(h.scheduler.pending().await.unwrap().is_none());

    let batches = h.gateway.batches();
    assert!(batches.iter().all(|b| b.len() <= 50));
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 1200);

    let items = h.catalog.items();
    assert!(items
        .iter()
        .all(|i| i.last_synced_at.map_or(false, |at| at >= job.started_at)));

    // The job is finished; further ticks are stale
    assert_eq!(
        h.driver.process_next_batch().await.unwrap(),
        TickOutcome::Idle
    );
    // Everything is fresh, so a new run finds nothing
    assert_eq!(
        h.driver.start_sync().await.unwrap(),
        StartOutcome::NothingToSync
    );
}

#[tokio::test]
async fn remote_failure_fails_job_and_keeps_earlier_marks() {
    let h = harness_with(settings(), 1200, RecordingGateway::fail_on_bulk_call(5));
    h.driver.start_sync().await.unwrap();

    for _ in 0..4 {
        assert!(matches!(
            h.driver.process_next_batch().await.unwrap(),
            TickOutcome::Advanced(_)
        ));
    }
    let outcome = h.driver.process_next_batch().await.unwrap();
    let TickOutcome::Failed(job) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.processed, 200);
    let error = job.last_error.clone().unwrap();
    assert!(error.contains("Service unavailable"));

    assert!(h.scheduler.pending().await.unwrap().is_none());
    assert_eq!(h.scheduler.armed_count(), 5);
    assert_eq!(synced_ids(&h.catalog), (1..=200).collect::<Vec<_>>());

    assert_eq!(
        h.driver.process_next_batch().await.unwrap(),
        TickOutcome::Idle
    );
    let status = h.driver.get_status().await.unwrap();
    assert_eq!(status.state, JobStatus::Failed);
    assert!(status.message.starts_with("Sync failed"));
}

#[tokio::test]
async fn direct_failure_propagates_and_keeps_earlier_batches() {
    let h = harness_with(settings(), 120, RecordingGateway::fail_on_bulk_call(2));

    let err = h.driver.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));
    assert_eq!(synced_ids(&h.catalog), (1..=50).collect::<Vec<_>>());

    let status = h.driver.get_status().await.unwrap();
    assert!(status.message.starts_with("Sync failed"));
    assert!(status.last_outcome.unwrap().last_error.is_some());
}

#[tokio::test]
async fn invalid_records_are_dropped_but_marked() {
    let h = harness(3);

    let mut no_price = priced(2);
    no_price.price = None;
    h.catalog.insert(no_price);

    let mut bad_image = priced(3);
    bad_image.images.insert(
        0,
        ItemImage {
            url: "not a url".into(),
            alt: String::new(),
        },
    );
    h.catalog.insert(bad_image);

    let StartOutcome::Completed(summary) = h.driver.start_sync().await.unwrap() else {
        panic!("expected a direct run");
    };
    assert_eq!(summary.synced, 2);
    assert_eq!(summary.rejected, 1);

    let batch = &h.gateway.batches()[0];
    let ids: Vec<&str> = batch.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids, vec!["site_1_1", "site_1_3"]);
    let record = &batch[1];
    assert_eq!(record.images.len(), 1);
    assert!(record.images[0].featured);
    assert_eq!(record.images[0].url, "https://cdn.example.com/3.jpg");

    assert_eq!(synced_ids(&h.catalog), vec![1, 2, 3]);
}

#[tokio::test]
async fn start_while_running_returns_existing_job() {
    let h = harness(1200);

    let StartOutcome::Started(first) = h.driver.start_sync().await.unwrap() else {
        panic!("expected a background job");
    };
    h.driver.process_next_batch().await.unwrap();

    let StartOutcome::AlreadyRunning(second) = h.driver.start_sync().await.unwrap() else {
        panic!("expected the running job");
    };
    assert_eq!(first.id, second.id);

    let job = h.store.load().await.unwrap().unwrap();
    assert_eq!(job.id, first.id);
    assert_eq!(job.processed, 50);
    assert_eq!(h.scheduler.armed_count(), 2);
}

#[tokio::test]
async fn cancelled_job_ignores_pending_tick() {
    let h = harness(1200);
    h.driver.start_sync().await.unwrap();

    let cancelled = h.driver.cancel().await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    assert!(h.scheduler.pending().await.unwrap().is_none());

    assert_eq!(
        h.driver.process_next_batch().await.unwrap(),
        TickOutcome::Idle
    );
    assert!(h.gateway.batches().is_empty());
    assert!(h.driver.cancel().await.unwrap().is_none());

    // A fresh start replaces the terminal record
    let StartOutcome::Started(handle) = h.driver.start_sync().await.unwrap() else {
        panic!("expected a new background job");
    };
    assert_ne!(handle.id, cancelled.id);
}

#[tokio::test]
async fn reset_clears_job_and_tick() {
    let h = harness(1200);
    h.driver.start_sync().await.unwrap();
    h.driver.reset().await.unwrap();

    assert!(h.store.load().await.unwrap().is_none());
    assert!(h.scheduler.pending().await.unwrap().is_none());
    assert_eq!(h.driver.get_status().await.unwrap().state, JobStatus::Idle);
}

/// Job store where another writer saves just before the n-th save.
struct RacingStore {
    inner: MemoryJobStore,
    saves: AtomicUsize,
    race_on: usize,
}

#[async_trait]
impl JobStore for RacingStore {
    async fn load(&self) -> Result<Option<SyncJob>> {
        self.inner.load().await
    }

    async fn save(&self, job: &SyncJob) -> Result<Option<SyncJob>> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.race_on {
            let current = self.inner.load().await?.unwrap();
            self.inner.save(&current).await?;
        }
        self.inner.save(job).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<()> {
        self.inner.record_outcome(outcome).await
    }

    async fn last_outcome(&self) -> Result<Option<SyncOutcome>> {
        self.inner.last_outcome().await
    }
}

#[tokio::test]
async fn tick_that_loses_the_claim_does_nothing() {
    let catalog = Arc::new(MemoryCatalog::new());
    for id in 1..=1200 {
        catalog.insert(priced(id));
    }
    let store = Arc::new(RacingStore {
        inner: MemoryJobStore::new(),
        saves: AtomicUsize::new(0),
        race_on: 2,
    });
    let gateway = Arc::new(RecordingGateway::new());
    let driver = SyncDriver::new(
        settings(),
        catalog.clone(),
        store.clone(),
        Arc::new(MemoryScheduler::new()),
        gateway.clone(),
    );

    driver.start_sync().await.unwrap();
    assert_eq!(
        driver.process_next_batch().await.unwrap(),
        TickOutcome::Conflict
    );
    assert!(gateway.batches().is_empty());
    assert!(synced_ids(&catalog).is_empty());

    // The next tick claims normally
    assert!(matches!(
        driver.process_next_batch().await.unwrap(),
        TickOutcome::Advanced(_)
    ));
    assert_eq!(gateway.batches().len(), 1);
}

/// Job store whose next load fails once when `fail_next_load` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryJobStore,
    fail_next_load: AtomicBool,
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn load(&self) -> Result<Option<SyncJob>> {
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inner.load().await
    }

    async fn save(&self, job: &SyncJob) -> Result<Option<SyncJob>> {
        self.inner.save(job).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<()> {
        self.inner.record_outcome(outcome).await
    }

    async fn last_outcome(&self) -> Result<Option<SyncOutcome>> {
        self.inner.last_outcome().await
    }
}

#[tokio::test]
async fn failed_tick_rearms_running_job() {
    let catalog = Arc::new(MemoryCatalog::new());
    for id in 1..=1200 {
        catalog.insert(priced(id));
    }
    let store = Arc::new(FlakyStore::default());
    let scheduler = Arc::new(MemoryScheduler::new());
    let gateway = Arc::new(RecordingGateway::new());
    let driver = SyncDriver::new(
        settings(),
        catalog,
        store.clone(),
        scheduler.clone(),
        gateway.clone(),
    );
    driver.start_sync().await.unwrap();

    store.fail_next_load.store(true, Ordering::SeqCst);
    let err = driver.fire_due_tick(Utc::now()).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    assert!(gateway.batches().is_empty());

    // The job is still running and back on the schedule
    assert!(scheduler.pending().await.unwrap().is_some());
    let outcome = driver.fire_due_tick(Utc::now()).await.unwrap();
    assert!(matches!(outcome, Some(TickOutcome::Advanced(_))));
    assert_eq!(gateway.batches().len(), 1);
}

#[tokio::test]
async fn stranded_job_is_rearmed_on_next_poll() {
    let h = harness(1200);
    h.driver.start_sync().await.unwrap();

    // The process took the tick and died before arming the next one
    h.scheduler.take_due(Utc::now()).await.unwrap().unwrap();
    assert!(h.scheduler.pending().await.unwrap().is_none());

    assert_eq!(h.driver.fire_due_tick(Utc::now()).await.unwrap(), None);
    assert!(h.scheduler.pending().await.unwrap().is_some());
    assert!(matches!(
        h.driver.fire_due_tick(Utc::now()).await.unwrap(),
        Some(TickOutcome::Advanced(_))
    ));

    // Nothing to re-arm once the job is over
    h.driver.cancel().await.unwrap();
    assert!(!h.driver.rearm_orphaned().await.unwrap());
    assert!(h.scheduler.pending().await.unwrap().is_none());
}

#[tokio::test]
async fn disabled_sync_is_a_configuration_error() {
    let h = harness_with(
        SyncConfig {
            enabled: false,
            ..settings()
        },
        3,
        RecordingGateway::new(),
    );
    let err = h.driver.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)));
    assert!(h.store.load().await.unwrap().is_none());
    assert!(h.store.last_outcome().await.unwrap().is_none());
    assert_eq!(
        h.driver.sync_item(1).await.unwrap(),
        ItemSyncOutcome::Disabled
    );
}

#[tokio::test]
async fn empty_catalog_has_nothing_to_sync() {
    let h = harness(0);
    assert_eq!(
        h.driver.start_sync().await.unwrap(),
        StartOutcome::NothingToSync
    );
    assert_eq!(
        h.driver.get_status().await.unwrap().message,
        "No items to sync"
    );
}

#[tokio::test]
async fn eligibility_predicate_and_hook_are_applied() {
    let h = harness(10);
    let predicate: EligibilityPredicate = Arc::new(|item: &CatalogItem| item.id % 2 == 1);
    let hook: MappingHook = Arc::new(|mut record: MappedRecord, item: &CatalogItem| {
        record.name = format!("{} (#{})", record.name, item.id);
        record
    });
    let driver = SyncDriver::new(
        settings(),
        h.catalog.clone(),
        h.store.clone(),
        h.scheduler.clone(),
        h.gateway.clone(),
    )
    .with_eligibility(predicate)
    .with_hook(hook);

    let StartOutcome::Completed(summary) = driver.start_sync().await.unwrap() else {
        panic!("expected a direct run");
    };
    assert_eq!(summary.processed, 10);
    assert_eq!(summary.synced, 5);

    let batch = &h.gateway.batches()[0];
    assert_eq!(batch.len(), 5);
    assert_eq!(batch[0].name, "Item 1 (#1)");
    assert_eq!(synced_ids(&h.catalog), vec![1, 3, 5, 7, 9]);
}

#[tokio::test]
async fn category_filter_limits_sync() {
    let h = harness_with(
        SyncConfig {
            categories: vec![99],
            ..settings()
        },
        5,
        RecordingGateway::new(),
    );
    let mut other = priced(6);
    other.categories = vec![ItemCategory {
        id: 99,
        name: "Desks".into(),
        slug: "desks".into(),
    }];
    h.catalog.insert(other);

    let StartOutcome::Completed(summary) = h.driver.start_sync().await.unwrap() else {
        panic!("expected a direct run");
    };
    assert_eq!(summary.synced, 1);
    assert_eq!(synced_ids(&h.catalog), vec![6]);
}

#[tokio::test]
async fn single_item_sync_and_delete() {
    let h = harness(3);
    let mut draft = priced(4);
    draft.status = PublishStatus::Draft;
    h.catalog.insert(draft);

    assert_eq!(
        h.driver.sync_item(2).await.unwrap(),
        ItemSyncOutcome::Synced {
            external_id: "site_1_2".into()
        }
    );
    assert_eq!(h.gateway.singles().len(), 1);
    assert_eq!(synced_ids(&h.catalog), vec![2]);

    assert_eq!(
        h.driver.sync_item(4).await.unwrap(),
        ItemSyncOutcome::Ineligible
    );
    assert_eq!(
        h.driver.sync_item(404).await.unwrap(),
        ItemSyncOutcome::NotFound
    );

    let mut unpriced = priced(5);
    unpriced.price = Some("free".into());
    h.catalog.insert(unpriced);
    assert!(matches!(
        h.driver.sync_item(5).await.unwrap(),
        ItemSyncOutcome::Rejected(_)
    ));

    let external_id = h.driver.external_id_for(3);
    h.driver.delete_item(&external_id).await.unwrap();
    assert_eq!(h.gateway.deleted(), vec![vec!["site_1_3".to_string()]]);
}

#[tokio::test]
async fn item_sync_during_background_run_keeps_job_coverage() {
    let h = harness_with(
        SyncConfig {
            direct_threshold: 10,
            ..settings()
        },
        0,
        RecordingGateway::new(),
    );
    let mut fresh = priced(1);
    fresh.last_synced_at = Some(Utc::now());
    h.catalog.insert(fresh);
    for id in 2..=121 {
        h.catalog.insert(priced(id));
    }

    let StartOutcome::Started(handle) = h.driver.start_sync().await.unwrap() else {
        panic!("expected a background job");
    };
    assert_eq!(handle.total, 120);
    assert!(matches!(
        h.driver.process_next_batch().await.unwrap(),
        TickOutcome::Advanced(_)
    ));

    // One item outside the run, one candidate the run has not reached yet
    h.driver.sync_item(1).await.unwrap();
    h.driver.sync_item(100).await.unwrap();

    loop {
        match h.driver.process_next_batch().await.unwrap() {
            TickOutcome::Advanced(_) => continue,
            TickOutcome::Completed(job) => {
                assert_eq!(job.processed, 120);
                break;
            }
            other => panic!("unexpected tick outcome {:?}", other),
        }
    }

    let sent: Vec<String> = h
        .gateway
        .batches()
        .into_iter()
        .flatten()
        .map(|r| r.external_id)
        .collect();
    let unique: HashSet<&String> = sent.iter().collect();
    assert_eq!(sent.len(), 120);
    assert_eq!(unique.len(), 120);
    assert!(!sent.contains(&h.driver.external_id_for(1)));
    assert!(sent.contains(&h.driver.external_id_for(121)));
    assert_eq!(synced_ids(&h.catalog).len(), 121);
}

#[tokio::test]
async fn connection_check_round_trips_test_record() {
    let h = harness_with(
        SyncConfig {
            enabled: false,
            ..settings()
        },
        0,
        RecordingGateway::new(),
    );
    h.driver.check_connection().await.unwrap();

    assert_eq!(h.gateway.singles()[0].external_id, "test-connection");
    assert_eq!(h.gateway.deleted(), vec![vec!["test-connection".to_string()]]);

    let down = harness_with(settings(), 0, RecordingGateway::unreachable());
    let err = down.driver.check_connection().await.unwrap_err();
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn sqlite_backed_job_resumes_across_ticks() {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}/csync.sqlite\"\n",
        tmp.path().display()
    ))
    .unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    for id in 1..=120 {
        catalog.upsert_item(&priced(id)).await.unwrap();
    }

    let gateway = Arc::new(RecordingGateway::new());
    let driver = SyncDriver::new(
        SyncConfig {
            direct_threshold: 100,
            ..settings()
        },
        catalog.clone(),
        Arc::new(SqliteJobStore::new(pool.clone())),
        Arc::new(SqliteScheduler::new(pool.clone())),
        gateway.clone(),
    );

    let StartOutcome::Started(handle) = driver.start_sync().await.unwrap() else {
        panic!("expected a background job");
    };
    assert_eq!(handle.total, 120);

    // Tick delay is zero, so the armed tick is due immediately
    let first = driver.fire_due_tick(chrono::Utc::now()).await.unwrap();
    assert!(matches!(first, Some(TickOutcome::Advanced(_))));
    assert!(matches!(
        driver.process_next_batch().await.unwrap(),
        TickOutcome::Advanced(_)
    ));
    let TickOutcome::Completed(job) = driver.process_next_batch().await.unwrap() else {
        panic!("expected completion on the short batch");
    };
    assert_eq!(job.processed, 120);
    assert_eq!(job.batch_index, 3);

    let sizes: Vec<usize> = gateway.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![50, 50, 20]);

    let stats = driver.stats().await.unwrap();
    assert_eq!(stats.synced, 120);
    assert_eq!(stats.stale, 0);
    assert_eq!(
        driver.start_sync().await.unwrap(),
        StartOutcome::NothingToSync
    );

    let item = catalog.get_item(1).await.unwrap().unwrap();
    assert!(item.last_synced_at.is_some());
}

//! Staleness selection.
//!
//! Wraps a [`Catalog`] with the installation's category filter, the staleness
//! window and the optional [`EligibilityPredicate`]. A [`Snapshot`] pins the
//! candidate set for one run so successive pages never overlap or skip.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::catalog::{CandidateQuery, Catalog};
use crate::models::CatalogItem;

/// Extra eligibility check applied after the catalog query.
pub type EligibilityPredicate = Arc<dyn Fn(&CatalogItem) -> bool + Send + Sync>;

/// Candidate set of one run: its id and the instant it started.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

/// One page of candidates.
///
/// `scanned` counts rows returned by the catalog before the eligibility
/// predicate, so it is what offsets and progress advance by.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<CatalogItem>,
    pub scanned: u64,
}

pub struct StalenessSelector {
    catalog: Arc<dyn Catalog>,
    categories: Vec<i64>,
    window: Duration,
    eligibility: Option<EligibilityPredicate>,
}

impl StalenessSelector {
    pub fn new(catalog: Arc<dyn Catalog>, categories: Vec<i64>, window: Duration) -> Self {
        Self {
            catalog,
            categories,
            window,
            eligibility: None,
        }
    }

    pub fn with_eligibility(mut self, predicate: EligibilityPredicate) -> Self {
        self.eligibility = Some(predicate);
        self
    }

    fn query(&self, snapshot: &Snapshot) -> CandidateQuery {
        CandidateQuery {
            stale_before: snapshot.started_at - self.window,
            run_id: Some(snapshot.run_id.clone()),
            categories: self.categories.clone(),
        }
    }

    pub async fn count_all(&self, snapshot: &Snapshot) -> Result<u64> {
        self.catalog.count_candidates(&self.query(snapshot)).await
    }

    pub async fn select(&self, snapshot: &Snapshot, offset: u64, limit: u64) -> Result<Page> {
        let rows = self
            .catalog
            .candidates(&self.query(snapshot), offset, limit)
            .await?;
        let scanned = rows.len() as u64;
        let items = match &self.eligibility {
            Some(eligible) => rows.into_iter().filter(|item| eligible(item)).collect(),
            None => rows,
        };
        Ok(Page { items, scanned })
    }

    /// Whether `item` currently belongs to the candidate set of `snapshot`.
    ///
    /// Items already marked by the run are not detected here; leaving their
    /// stored run untouched keeps them in the set.
    pub fn in_snapshot(&self, snapshot: &Snapshot, item: &CatalogItem) -> bool {
        self.query(snapshot).matches(item, None)
    }

    /// Whether a single item would be synced right now, ignoring staleness.
    pub fn is_eligible(&self, item: &CatalogItem) -> bool {
        item.status.is_publishable()
            && item.in_any_category(&self.categories)
            && self.eligibility.as_ref().map(|f| f(item)).unwrap_or(true)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

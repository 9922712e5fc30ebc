//! Core data models used throughout catalog-sync.
//!
//! [`CatalogItem`] is owned by the host catalog; the engine only reads it and
//! writes back `last_synced_at`. [`MappedRecord`] is the wire form sent to the
//! remote service. [`SyncJob`] is the single persisted job record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Publication status as stored by the host catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    #[default]
    Publish,
    Draft,
    Pending,
    Private,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Publish => "publish",
            PublishStatus::Draft => "draft",
            PublishStatus::Pending => "pending",
            PublishStatus::Private => "private",
        }
    }

    pub fn is_publishable(&self) -> bool {
        matches!(self, PublishStatus::Publish)
    }
}

impl FromStr for PublishStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(PublishStatus::Publish),
            "draft" => Ok(PublishStatus::Draft),
            "pending" => Ok(PublishStatus::Pending),
            "private" => Ok(PublishStatus::Private),
            other => anyhow::bail!("unknown publish status: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemImage {
    pub url: String,
    #[serde(default)]
    pub alt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// A taxonomy attribute; `values` holds one entry per selected term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAttribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub weight: Option<String>,
    pub length: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

/// A sellable item as read from the host catalog.
///
/// Prices are kept as the strings the catalog stores; the mapper decides
/// whether they are numeric. `images[0]` is the primary image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub regular_price: Option<String>,
    #[serde(default)]
    pub sale_price: Option<String>,
    #[serde(default)]
    pub stock: Option<i64>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    #[serde(default)]
    pub status: PublishStatus,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub images: Vec<ItemImage>,
    #[serde(default)]
    pub categories: Vec<ItemCategory>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

fn default_in_stock() -> bool {
    true
}

fn default_kind() -> String {
    "simple".to_string()
}

impl CatalogItem {
    /// A published item with only the required fields set.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: String::new(),
            sku: None,
            price: None,
            regular_price: None,
            sale_price: None,
            stock: None,
            in_stock: true,
            status: PublishStatus::Publish,
            kind: default_kind(),
            featured: false,
            permalink: None,
            images: Vec::new(),
            categories: Vec::new(),
            attributes: Vec::new(),
            dimensions: Dimensions::default(),
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }

    pub fn in_any_category(&self, filter: &[i64]) -> bool {
        filter.is_empty() || self.categories.iter().any(|c| filter.contains(&c.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Published,
    Draft,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedImage {
    pub url: String,
    pub alt: String,
    pub featured: bool,
}

/// Wire record sent to the remote service. Built fresh per attempt.
///
/// `attributes` is a map so it always serializes as a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedRecord {
    pub external_id: String,
    pub name: String,
    pub description: String,
    pub price: Option<f64>,
    pub currency: String,
    pub sku: String,
    pub categories: Vec<String>,
    pub images: Vec<MappedImage>,
    pub attributes: BTreeMap<String, String>,
    pub stock: Option<i64>,
    pub status: RecordStatus,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => anyhow::bail!("unknown job status: '{}'", other),
        }
    }
}

/// The persisted background job. There is at most one per installation.
///
/// `version` is the value read from the store; saving succeeds only while
/// the stored version still matches (0 means "no record yet").
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub total: u64,
    pub processed: u64,
    pub batch_index: u64,
    pub rejected: u64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub version: i64,
}

impl SyncJob {
    pub fn start(id: Uuid, total: u64, started_at: DateTime<Utc>, version: i64) -> Self {
        Self {
            id,
            total,
            processed: 0,
            batch_index: 0,
            rejected: 0,
            status: JobStatus::Running,
            started_at,
            updated_at: started_at,
            last_error: None,
            version,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            total: self.total,
            started_at: self.started_at,
        }
    }
}

/// Identity of a job returned to trigger callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub total: u64,
    pub started_at: DateTime<Utc>,
}

/// Last human-readable outcome, kept for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub message: String,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Counters shown by `csync stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogStats {
    pub published: u64,
    pub synced: u64,
    pub pending: u64,
    pub stale: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_item_deserializes_with_defaults() {
        let item: CatalogItem =
            serde_json::from_str(r#"{"id": 7, "name": "Mug", "price": "9.50"}"#).unwrap();
        assert_eq!(item.status, PublishStatus::Publish);
        assert_eq!(item.kind, "simple");
        assert!(item.in_stock);
        assert!(item.images.is_empty());
        assert!(item.last_synced_at.is_none());
    }

    #[test]
    fn category_filter_matches_any() {
        let mut item = CatalogItem::new(1, "Lamp");
        item.categories.push(ItemCategory {
            id: 4,
            name: "Lighting".into(),
            slug: "lighting".into(),
        });
        assert!(item.in_any_category(&[]));
        assert!(item.in_any_category(&[3, 4]));
        assert!(!item.in_any_category(&[3]));
    }

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Idle,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }
}

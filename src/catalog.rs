//! Catalog access.
//!
//! The [`Catalog`] trait is everything the sync engine needs from the host
//! catalog: counting and paging sync candidates, looking up one item, writing
//! back `last_synced_at`, and summary counts. [`SqliteCatalog`] is the
//! concrete backend used by the `csync` binary; an in-memory implementation
//! lives in [`crate::memory`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db::ts_to_datetime;
use crate::models::{
    CatalogItem, CatalogStats, Dimensions, ItemAttribute, ItemCategory, ItemImage,
};

/// Predicate describing one consistent candidate set.
///
/// An item is a candidate when it is published, in one of `categories`
/// (empty = all), and either never synced, synced before `stale_before`, or
/// already marked by `run_id`. The last clause keeps a run's own marks inside
/// its snapshot so offsets stay stable while the run progresses.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub stale_before: DateTime<Utc>,
    pub run_id: Option<String>,
    pub categories: Vec<i64>,
}

impl CandidateQuery {
    /// In-process evaluation of the same predicate the SQL backend uses.
    pub fn matches(&self, item: &CatalogItem, marked_by: Option<&str>) -> bool {
        if !item.status.is_publishable() || !item.in_any_category(&self.categories) {
            return false;
        }
        let stale = match item.last_synced_at {
            None => true,
            Some(at) => at.timestamp() < self.stale_before.timestamp(),
        };
        let own_mark = match (&self.run_id, marked_by) {
            (Some(run), Some(marked)) => run == marked,
            _ => false,
        };
        stale || own_mark
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Number of items matching `query`.
    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64>;

    /// Page of candidates ordered by item id.
    async fn candidates(
        &self,
        query: &CandidateQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>>;

    async fn get_item(&self, id: i64) -> Result<Option<CatalogItem>>;

    /// Set `last_synced_at = at` on every id. A `run_id` of `None` leaves
    /// the stored run untouched.
    async fn mark_synced(&self, ids: &[i64], at: DateTime<Utc>, run_id: Option<&str>)
        -> Result<()>;

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<CatalogStats>;
}

const ITEM_COLUMNS: &str = "i.id, i.name, i.description, i.sku, i.price, i.regular_price, \
    i.sale_price, i.stock, i.in_stock, i.status, i.kind, i.featured, i.permalink, i.weight, \
    i.length, i.width, i.height, i.created_at, i.updated_at, i.last_synced_at";

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an item and its images, categories and attributes.
    ///
    /// An existing `last_synced_at` survives unless the incoming item carries one.
    pub async fn upsert_item(&self, item: &CatalogItem) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO items (id, name, description, sku, price, regular_price, sale_price, stock, in_stock, status, kind, featured, permalink, weight, length, width, height, created_at, updated_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                sku = excluded.sku,
                price = excluded.price,
                regular_price = excluded.regular_price,
                sale_price = excluded.sale_price,
                stock = excluded.stock,
                in_stock = excluded.in_stock,
                status = excluded.status,
                kind = excluded.kind,
                featured = excluded.featured,
                permalink = excluded.permalink,
                weight = excluded.weight,
                length = excluded.length,
                width = excluded.width,
                height = excluded.height,
                updated_at = excluded.updated_at,
                last_synced_at = COALESCE(excluded.last_synced_at, items.last_synced_at)
            "#,
        )
        .bind(item.id)
        .bind(&item.name)
        .bind(&item.description)
        .bind(&item.sku)
        .bind(&item.price)
        .bind(&item.regular_price)
        .bind(&item.sale_price)
        .bind(item.stock)
        .bind(item.in_stock)
        .bind(item.status.as_str())
        .bind(&item.kind)
        .bind(item.featured)
        .bind(&item.permalink)
        .bind(&item.dimensions.weight)
        .bind(&item.dimensions.length)
        .bind(&item.dimensions.width)
        .bind(&item.dimensions.height)
        .bind(item.created_at.timestamp())
        .bind(item.updated_at.timestamp())
        .bind(item.last_synced_at.map(|t| t.timestamp()))
        .execute(&mut *tx)
        .await?;

        for table in ["item_images", "item_categories", "item_attributes"] {
            sqlx::query(&format!("DELETE FROM {} WHERE item_id = ?", table))
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
        }

        for (position, image) in item.images.iter().enumerate() {
            sqlx::query("INSERT INTO item_images (item_id, position, url, alt) VALUES (?, ?, ?, ?)")
                .bind(item.id)
                .bind(position as i64)
                .bind(&image.url)
                .bind(&image.alt)
                .execute(&mut *tx)
                .await?;
        }

        for category in &item.categories {
            sqlx::query(
                "INSERT OR REPLACE INTO item_categories (item_id, category_id, name, slug) VALUES (?, ?, ?, ?)",
            )
            .bind(item.id)
            .bind(category.id)
            .bind(&category.name)
            .bind(&category.slug)
            .execute(&mut *tx)
            .await?;
        }

        for (position, attribute) in item.attributes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO item_attributes (item_id, position, name, values_json) VALUES (?, ?, ?, ?)",
            )
            .bind(item.id)
            .bind(position as i64)
            .bind(&attribute.name)
            .bind(serde_json::to_string(&attribute.values)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load items from a JSON array or JSON-lines file.
    pub async fn import_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read import file: {}", path.display()))?;
        let items = parse_items(&content)?;
        for item in &items {
            self.upsert_item(item)
                .await
                .with_context(|| format!("Failed to import item {}", item.id))?;
        }
        Ok(items.len())
    }

    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<CatalogItem>> {
        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>>>()?;
        if items.is_empty() {
            return Ok(items);
        }
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();

        let mut images: HashMap<i64, Vec<ItemImage>> = HashMap::new();
        for row in self
            .fetch_children("SELECT item_id, url, alt FROM item_images", &ids, "position")
            .await?
        {
            images
                .entry(row.try_get("item_id")?)
                .or_default()
                .push(ItemImage {
                    url: row.try_get("url")?,
                    alt: row.try_get("alt")?,
                });
        }

        let mut categories: HashMap<i64, Vec<ItemCategory>> = HashMap::new();
        for row in self
            .fetch_children(
                "SELECT item_id, category_id, name, slug FROM item_categories",
                &ids,
                "category_id",
            )
            .await?
        {
            categories
                .entry(row.try_get("item_id")?)
                .or_default()
                .push(ItemCategory {
                    id: row.try_get("category_id")?,
                    name: row.try_get("name")?,
                    slug: row.try_get("slug")?,
                });
        }

        let mut attributes: HashMap<i64, Vec<ItemAttribute>> = HashMap::new();
        for row in self
            .fetch_children(
                "SELECT item_id, name, values_json FROM item_attributes",
                &ids,
                "position",
            )
            .await?
        {
            let item_id: i64 = row.try_get("item_id")?;
            let name: String = row.try_get("name")?;
            let values_json: String = row.try_get("values_json")?;
            let values = serde_json::from_str(&values_json).with_context(|| {
                format!("Corrupt values for attribute '{}' of item {}", name, item_id)
            })?;
            attributes
                .entry(item_id)
                .or_default()
                .push(ItemAttribute { name, values });
        }

        for item in &mut items {
            item.images = images.remove(&item.id).unwrap_or_default();
            item.categories = categories.remove(&item.id).unwrap_or_default();
            item.attributes = attributes.remove(&item.id).unwrap_or_default();
        }
        Ok(items)
    }

    async fn fetch_children(
        &self,
        select: &str,
        ids: &[i64],
        order_by: &str,
    ) -> Result<Vec<SqliteRow>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(select);
        qb.push(" WHERE item_id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        qb.push(format!(" ORDER BY item_id, {}", order_by));
        Ok(qb.build().fetch_all(&self.pool).await?)
    }
}

fn push_candidate_filter(qb: &mut QueryBuilder<Sqlite>, query: &CandidateQuery) {
    qb.push(" WHERE i.status = 'publish' AND (i.last_synced_at IS NULL OR i.last_synced_at < ");
    qb.push_bind(query.stale_before.timestamp());
    if let Some(run) = &query.run_id {
        qb.push(" OR i.last_sync_run = ");
        qb.push_bind(run.clone());
    }
    qb.push(")");

    if !query.categories.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM item_categories c WHERE c.item_id = i.id AND c.category_id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in &query.categories {
            sep.push_bind(*id);
        }
        sep.push_unseparated("))");
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM items i");
        push_candidate_filter(&mut qb, query);
        let count: i64 = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn candidates(
        &self,
        query: &CandidateQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM items i", ITEM_COLUMNS));
        push_candidate_filter(&mut qb, query);
        qb.push(" ORDER BY i.id LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn get_item(&self, id: i64) -> Result<Option<CatalogItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM items i WHERE i.id = ?", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn mark_synced(
        &self,
        ids: &[i64],
        at: DateTime<Utc>,
        run_id: Option<&str>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE items SET last_synced_at = ");
        qb.push_bind(at.timestamp());
        qb.push(", last_sync_run = COALESCE(");
        qb.push_bind(run_id.map(str::to_string));
        qb.push(", last_sync_run) WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<CatalogStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS published,
                COUNT(last_synced_at) AS synced,
                SUM(CASE WHEN last_synced_at IS NULL OR last_synced_at < ? THEN 1 ELSE 0 END) AS stale
            FROM items
            WHERE status = 'publish'
            "#,
        )
        .bind(stale_before.timestamp())
        .fetch_one(&self.pool)
        .await?;

        let published: i64 = row.try_get("published")?;
        let synced: i64 = row.try_get("synced")?;
        let stale: Option<i64> = row.try_get("stale")?;

        Ok(CatalogStats {
            published: published as u64,
            synced: synced as u64,
            pending: (published - synced).max(0) as u64,
            stale: stale.unwrap_or(0) as u64,
        })
    }
}

fn item_from_row(row: &SqliteRow) -> Result<CatalogItem> {
    let status: String = row.try_get("status")?;
    Ok(CatalogItem {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        sku: row.try_get("sku")?,
        price: row.try_get("price")?,
        regular_price: row.try_get("regular_price")?,
        sale_price: row.try_get("sale_price")?,
        stock: row.try_get("stock")?,
        in_stock: row.try_get("in_stock")?,
        status: status.parse()?,
        kind: row.try_get("kind")?,
        featured: row.try_get("featured")?,
        permalink: row.try_get("permalink")?,
        images: Vec::new(),
        categories: Vec::new(),
        attributes: Vec::new(),
        dimensions: Dimensions {
            weight: row.try_get("weight")?,
            length: row.try_get("length")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
        },
        created_at: ts_to_datetime(row.try_get("created_at")?),
        updated_at: ts_to_datetime(row.try_get("updated_at")?),
        last_synced_at: row
            .try_get::<Option<i64>, _>("last_synced_at")?
            .map(ts_to_datetime),
    })
}

/// Accepts either a JSON array of items or one item per line.
pub fn parse_items(content: &str) -> Result<Vec<CatalogItem>> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content).context("Invalid JSON array of catalog items");
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid catalog item on line {}", n + 1))
        })
        .collect()
}

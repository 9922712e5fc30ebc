use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Catalog items, standing in for the host catalog
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            sku TEXT,
            price TEXT,
            regular_price TEXT,
            sale_price TEXT,
            stock INTEGER,
            in_stock INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'publish',
            kind TEXT NOT NULL DEFAULT 'simple',
            featured INTEGER NOT NULL DEFAULT 0,
            permalink TEXT,
            weight TEXT,
            length TEXT,
            width TEXT,
            height TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER,
            last_sync_run TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_images (
            item_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            url TEXT NOT NULL,
            alt TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (item_id, position),
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_categories (
            item_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            slug TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (item_id, category_id),
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_attributes (
            item_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            values_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (item_id, position),
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Singleton job record; `version` backs compare-and-swap saves
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_job (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            id TEXT NOT NULL,
            total INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            batch_index INTEGER NOT NULL,
            rejected INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_error TEXT,
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_ticks (
            hook TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            due_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_status ON items(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_last_synced_at ON items(last_synced_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_item_categories_category ON item_categories(category_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

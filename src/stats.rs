//! Catalog sync statistics.
//!
//! Provides a quick summary of where the catalog stands against the remote
//! service: how many items are published, how many were ever synced, how many
//! are waiting, and what the last run did. Used by `csync stats`.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::driver::SyncDriver;
use crate::progress::format_number;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let driver = SyncDriver::open(config).await?;
    let stats = driver.stats().await?;
    let status = driver.get_status().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Catalog Sync — Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Sync:        {}",
        if config.sync.enabled { "enabled" } else { "disabled" }
    );
    println!();
    println!("  Published:   {}", format_number(stats.published));
    println!(
        "  Synced:      {} / {} ({}%)",
        format_number(stats.synced),
        format_number(stats.published),
        if stats.published > 0 {
            (stats.synced * 100) / stats.published
        } else {
            0
        }
    );
    println!("  Pending:     {}", format_number(stats.pending));
    println!("  Stale:       {}", format_number(stats.stale));
    println!();
    println!("  Status:      {}", status.message);
    let last_sync = status
        .last_outcome
        .as_ref()
        .map(|o| format_relative(o.at, Utc::now()))
        .unwrap_or_else(|| "never".to_string());
    println!("  Last sync:   {}", last_sync);
    if let Some(error) = status.last_outcome.as_ref().and_then(|o| o.last_error.as_ref()) {
        println!("  Last error:  {}", error);
    }
    if let Some(due) = status.next_tick_at {
        println!("  Next tick:   {}", due.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
pub fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();

    if delta < 0 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn bytes_scale_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_relative(now, now), "just now");
        assert_eq!(format_relative(now - Duration::minutes(1), now), "1 min ago");
        assert_eq!(format_relative(now - Duration::hours(5), now), "5 hours ago");
        assert_eq!(format_relative(now - Duration::days(2), now), "2 days ago");
    }
}

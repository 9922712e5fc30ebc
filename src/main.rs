//! # Catalog Sync CLI (`csync`)
//!
//! The `csync` binary drives catalog synchronization from the command line:
//! database setup, catalog import, starting and advancing syncs, inspecting
//! status, and running the HTTP trigger server.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the SQLite database and run schema migrations |
//! | `csync import <file>` | Load catalog items from JSON or JSON lines |
//! | `csync sync` | Start a sync (direct or background) |
//! | `csync tick` | Fire the pending background tick if it is due |
//! | `csync status` | Show the current job or the last outcome |
//! | `csync stats` | Show catalog sync counters |
//! | `csync sync-item <id>` | Push one item now |
//! | `csync delete <id>` | Delete one record from the remote service |
//! | `csync ping` | Verify endpoint and API key |
//! | `csync cancel` | Cancel the running background job |
//! | `csync reset` | Forget the job record and pending tick |
//! | `csync serve` | Start the HTTP trigger server |
//!
//! ## Examples
//!
//! ```bash
//! # Cron-driven background sync
//! * * * * * csync --config /etc/csync.toml tick
//!
//! # One-off sync that runs every batch before returning
//! csync sync --follow
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use catalog_sync::catalog::SqliteCatalog;
use catalog_sync::driver::{ItemSyncOutcome, StartOutcome, SyncDriver, TickOutcome};
use catalog_sync::progress::ProgressMode;
use catalog_sync::{config, db, logging, migrate, server, stats};

/// Catalog Sync CLI: push a local product catalog to a remote
/// recommendation service in resumable batches.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/csync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Catalog Sync: incremental catalog synchronization with a remote recommendation service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, otherwise `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Load catalog items from a file (JSON array or one object per line).
    ///
    /// Existing items are replaced; their sync marks are kept.
    Import {
        /// Path to the items file.
        file: PathBuf,
    },

    /// Start a sync.
    ///
    /// Catalogs below `sync.direct_threshold` candidates sync within this
    /// command. Larger ones start a background job advanced by `tick`.
    Sync {
        /// Keep running background ticks until the job finishes.
        #[arg(long)]
        follow: bool,
    },

    /// Run the pending background tick if it is due.
    Tick {
        /// Advance the job now, ignoring the scheduled time.
        #[arg(long)]
        force: bool,
    },

    /// Show the current job or the last sync outcome.
    Status,

    /// Show catalog sync counters.
    Stats,

    /// Push a single item to the remote service now.
    SyncItem {
        /// Catalog item id.
        id: i64,
    },

    /// Delete a record from the remote service.
    Delete {
        /// Catalog item id, or an external id as sent to the service.
        target: String,
    },

    /// Verify the endpoint and API key with a throwaway record.
    Ping,

    /// Cancel the running background job.
    Cancel,

    /// Forget the job record and any pending tick.
    Reset,

    /// Start the HTTP trigger server and the periodic trigger loop.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging("info");
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let count = SqliteCatalog::new(pool.clone()).import_file(&file).await?;
            pool.close().await;
            println!("Imported {} items.", count);
        }
        Commands::Sync { follow } => {
            let driver = open_driver(&cfg, progress).await?;
            match driver.start_sync().await? {
                StartOutcome::NothingToSync => println!("No items to sync."),
                StartOutcome::Completed(summary) => println!("{}", summary.message),
                StartOutcome::AlreadyRunning(handle) => {
                    println!("Sync already running: job {} ({} items)", handle.id, handle.total);
                }
                StartOutcome::Started(handle) => {
                    println!("Sync started: job {} ({} items)", handle.id, handle.total);
                    if follow {
                        follow_job(&driver, Duration::from_secs(cfg.sync.tick_delay_secs))
                            .await?;
                    }
                }
            }
        }
        Commands::Tick { force } => {
            let driver = open_driver(&cfg, progress).await?;
            let outcome = if force {
                Some(driver.process_next_batch().await?)
            } else {
                driver.fire_due_tick(chrono::Utc::now()).await?
            };
            match outcome {
                Some(outcome) => print_tick(&outcome),
                None => println!("No tick due."),
            }
        }
        Commands::Status => {
            let driver = open_driver(&cfg, progress).await?;
            let status = driver.get_status().await?;
            println!("State:    {}", status.state);
            println!("Message:  {}", status.message);
            if let Some(job) = &status.job {
                println!("Job:      {} (batch {})", job.id, job.batch_index);
                println!("Progress: {} / {}", job.processed, job.total);
                if let Some(error) = &job.last_error {
                    println!("Error:    {}", error);
                }
            }
            if let Some(due) = status.next_tick_at {
                println!("Next tick: {}", due.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::SyncItem { id } => {
            let driver = open_driver(&cfg, progress).await?;
            match driver.sync_item(id).await? {
                ItemSyncOutcome::Synced { external_id } => println!("Synced {}.", external_id),
                ItemSyncOutcome::Disabled => println!("Sync is disabled."),
                ItemSyncOutcome::NotFound => anyhow::bail!("no catalog item with id {}", id),
                ItemSyncOutcome::Ineligible => println!("Item {} is not eligible for sync.", id),
                ItemSyncOutcome::Rejected(errors) => {
                    println!("Item {} failed validation:", id);
                    for error in errors {
                        println!("  - {}", error);
                    }
                }
            }
        }
        Commands::Delete { target } => {
            let driver = open_driver(&cfg, progress).await?;
            let external_id = match target.parse::<i64>() {
                Ok(id) => driver.external_id_for(id),
                Err(_) => target,
            };
            driver.delete_item(&external_id).await?;
            println!("Deleted {}.", external_id);
        }
        Commands::Ping => {
            let driver = open_driver(&cfg, progress).await?;
            driver.check_connection().await?;
            println!("Connection OK.");
        }
        Commands::Cancel => {
            let driver = open_driver(&cfg, progress).await?;
            match driver.cancel().await? {
                Some(job) => println!("Cancelled job {}.", job.id),
                None => println!("No sync running."),
            }
        }
        Commands::Reset => {
            let driver = open_driver(&cfg, progress).await?;
            driver.reset().await?;
            println!("Sync state reset.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_driver(cfg: &config::Config, progress: ProgressMode) -> anyhow::Result<SyncDriver> {
    Ok(SyncDriver::open(cfg)
        .await?
        .with_progress(Arc::from(progress.reporter())))
}

/// Run ticks back to back, pausing `delay` between them, until the job stops.
async fn follow_job(driver: &SyncDriver, delay: Duration) -> anyhow::Result<()> {
    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = driver.process_next_batch().await?;
        match outcome {
            TickOutcome::Advanced(_) => continue,
            other => {
                print_tick(&other);
                return Ok(());
            }
        }
    }
}

fn print_tick(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Idle => println!("No sync running."),
        TickOutcome::Conflict => println!("Job changed concurrently; tick skipped."),
        TickOutcome::Advanced(job) => {
            println!("Batch {} done: {} / {} items.", job.batch_index, job.processed, job.total)
        }
        TickOutcome::Completed(job) => {
            println!("Sync completed: {} items.", job.processed)
        }
        TickOutcome::Failed(job) => println!(
            "Sync failed: {}",
            job.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

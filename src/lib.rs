//! # Catalog Sync
//!
//! Incremental synchronization of a local product catalog with a remote
//! recommendation service.
//!
//! Items that were never pushed, or were pushed longer ago than the
//! staleness window, are mapped to the service's wire format, validated, and
//! sent in batches of at most 50. Small catalogs sync inside a single call;
//! large ones become a resumable background job advanced one batch per tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Catalog  │──▶│ Selector  │──▶│  Mapper  │──▶│ Gateway  │──▶ remote
//! │ (SQLite) │   │ snapshot  │   │ validate │   │  (HTTP)  │
//! └──────────┘   └───────────┘   └──────────┘   └──────────┘
//!                      ▲                              │
//!                      └──────── SyncDriver ◀─────────┘
//!                           │              │
//!                      ┌──────────┐   ┌───────────┐
//!                      │ JobStore │   │ Scheduler │
//!                      └──────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init                    # create database
//! csync import catalog.json     # load items
//! csync ping                    # verify endpoint and API key
//! csync sync --follow           # sync, running background ticks inline
//! csync serve                   # HTTP triggers + periodic syncs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`catalog`] | Catalog trait and SQLite backend |
//! | [`selector`] | Staleness selection and paging |
//! | [`mapper`] | Item to wire record mapping and validation |
//! | [`gateway`] | Remote service client |
//! | [`job_store`] | Versioned job persistence |
//! | [`scheduler`] | Follow-up ticks and the trigger loop |
//! | [`driver`] | The sync state machine |
//! | [`memory`] | In-memory backends |
//! | [`server`] | HTTP trigger server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod job_store;
pub mod logging;
pub mod mapper;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod scheduler;
pub mod selector;
pub mod server;
pub mod stats;

//! HTTP trigger server.
//!
//! Exposes the sync driver's trigger surface as a small JSON API so a host
//! application (or an admin UI) can start, advance and inspect syncs, and
//! runs the trigger loop that fires due ticks and periodic syncs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/sync/status` | Current job, last outcome, next tick |
//! | `POST` | `/sync/start` | Start a sync (direct or background) |
//! | `POST` | `/sync/tick` | Advance the background job by one batch |
//! | `POST` | `/sync/cancel` | Cancel the running job |
//! | `POST` | `/items/{id}/sync` | Push one item now |
//! | `DELETE` | `/records/{external_id}` | Delete one remote record |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "configuration", "message": "sync is disabled" } }
//! ```
//!
//! Error codes: `configuration` (400), `conflict` (409), `remote` (502),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::driver::{ItemSyncOutcome, StartOutcome, SyncDriver, SyncStatus, TickOutcome};
use crate::error::SyncError;
use crate::scheduler::run_trigger_loop;

/// Starts the trigger server and the background trigger loop.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let driver = Arc::new(SyncDriver::open(config).await?);

    let trigger = tokio::spawn(run_trigger_loop(
        driver.clone(),
        Duration::from_secs(config.server.poll_secs),
        config.sync.frequency.interval(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Sync server listening on http://{}", config.server.bind);
    info!(bind = %config.server.bind, "trigger server started");

    let served = axum::serve(listener, router(driver)).await;
    trigger.abort();
    served?;
    Ok(())
}

/// Routes over a shared driver.
pub fn router(driver: Arc<SyncDriver>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sync/status", get(handle_status))
        .route("/sync/start", post(handle_start))
        .route("/sync/tick", post(handle_tick))
        .route("/sync/cancel", post(handle_cancel))
        .route("/items/{id}/sync", post(handle_sync_item))
        .route("/records/{external_id}", delete(handle_delete))
        .layer(cors)
        .with_state(driver)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::Configuration(_) => (StatusCode::BAD_REQUEST, "configuration"),
            SyncError::Conflict => (StatusCode::CONFLICT, "conflict"),
            SyncError::Remote(_) => (StatusCode::BAD_GATEWAY, "remote"),
            SyncError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status(State(driver): State<Arc<SyncDriver>>) -> Result<Json<SyncStatus>, AppError> {
    Ok(Json(driver.get_status().await?))
}

/// Direct runs finish before the response; background runs return 202.
async fn handle_start(
    State(driver): State<Arc<SyncDriver>>,
) -> Result<(StatusCode, Json<StartOutcome>), AppError> {
    let outcome = driver.start_sync().await?;
    let status = match outcome {
        StartOutcome::Started(_) => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn handle_tick(State(driver): State<Arc<SyncDriver>>) -> Result<Json<TickOutcome>, AppError> {
    Ok(Json(driver.process_next_batch().await?))
}

async fn handle_cancel(State(driver): State<Arc<SyncDriver>>) -> Result<Json<Value>, AppError> {
    let cancelled = driver.cancel().await?;
    Ok(Json(json!({ "cancelled": cancelled.map(|j| j.id) })))
}

async fn handle_sync_item(
    State(driver): State<Arc<SyncDriver>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let body = match driver.sync_item(id).await? {
        ItemSyncOutcome::Synced { external_id } => {
            json!({ "outcome": "synced", "external_id": external_id })
        }
        ItemSyncOutcome::Disabled => json!({ "outcome": "disabled" }),
        ItemSyncOutcome::Ineligible => json!({ "outcome": "ineligible" }),
        ItemSyncOutcome::NotFound => {
            return Err(AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: format!("no catalog item with id {}", id),
            })
        }
        ItemSyncOutcome::Rejected(errors) => json!({
            "outcome": "rejected",
            "errors": errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        }),
    };
    Ok(Json(body))
}

async fn handle_delete(
    State(driver): State<Arc<SyncDriver>>,
    Path(external_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ack = driver.delete_item(&external_id).await?;
    Ok(Json(json!({ "deleted": external_id, "remote_status": ack.status })))
}

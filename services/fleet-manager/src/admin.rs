//! Admin API
//!
//! Operator surface for the fleet, served on its own listener. Every
//! response is JSON except `/metrics`.
//!
//! Endpoints:
//! - GET    /health                       pool summary, live workers, uptime
//! - GET    /metrics                      Prometheus text exposition
//! - GET    /admin/workers                workers with in-memory state
//! - POST   /admin/workers                create a worker on a free credential
//! - POST   /admin/workers/start-all      start every stopped worker
//! - POST   /admin/workers/stop-all       stop every live worker
//! - POST   /admin/workers/{id}/start
//! - POST   /admin/workers/{id}/stop
//! - POST   /admin/workers/{id}/failover  move the worker to a fresh credential
//! - DELETE /admin/workers/{id}           stop, release the credential, delete
//! - GET    /admin/credentials            ids, status and fingerprints only
//! - POST   /admin/credentials            bulk import
//! - DELETE /admin/credentials            bulk delete, in-use ids are skipped
//! - GET    /admin/pool                   pool health summary
//! - POST   /admin/broadcast              message every known user
//! - POST   /admin/greetings              rewrite sent greetings

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use fleet::{Error, FleetManager, fingerprint};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<FleetManager>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AdminState {
    pub fn new(manager: Arc<FleetManager>, prometheus: PrometheusHandle) -> Self {
        Self {
            manager,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the admin router, limited to `max_connections` concurrent requests.
pub fn build_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/workers", get(list_workers).post(create_worker))
        .route("/admin/workers/start-all", post(start_all))
        .route("/admin/workers/stop-all", post(stop_all))
        .route("/admin/workers/{id}", axum::routing::delete(delete_worker))
        .route("/admin/workers/{id}/start", post(start_worker))
        .route("/admin/workers/{id}/stop", post(stop_worker))
        .route("/admin/workers/{id}/failover", post(failover_worker))
        .route(
            "/admin/credentials",
            get(list_credentials)
                .post(add_credentials)
                .delete(delete_credentials),
        )
        .route("/admin/pool", get(pool_status))
        .route("/admin/broadcast", post(broadcast))
        .route("/admin/greetings", post(edit_greetings))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        Error::PoolExhausted | Error::InvalidState { .. } => StatusCode::CONFLICT,
        Error::CredentialInvalid(_) | Error::Transient(_) => StatusCode::BAD_GATEWAY,
        Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "admin request failed");
    }
    json_response(status, serde_json::json!({ "error": e.to_string() }))
}

fn bad_request(message: &str) -> Response {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": message }),
    )
}

/// GET /health: always 200 while the process serves requests; the pool
/// object carries its own healthy/degraded/unhealthy status.
async fn health_handler(State(state): State<AdminState>) -> Response {
    let pool = state.manager.pool().health().await;
    let workers = state.manager.list_workers().await;
    let live = workers.iter().filter(|w| w.live).count();

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "workers_total": workers.len(),
            "workers_live": live,
            "pool": pool,
        }),
    )
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

// --- Workers ---

async fn list_workers(State(state): State<AdminState>) -> Response {
    let workers = state.manager.list_workers().await;
    json_response(StatusCode::OK, serde_json::json!({ "workers": workers }))
}

/// POST /admin/workers: 201 with the new worker, 409 when no credential is free.
async fn create_worker(State(state): State<AdminState>) -> Response {
    let id = match state.manager.create_worker().await {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.manager.worker(id).await {
        Ok(view) => json_response(StatusCode::CREATED, serde_json::json!({ "worker": view })),
        Err(e) => error_response(&e),
    }
}

async fn start_all(State(state): State<AdminState>) -> Response {
    let report = state.manager.start_all().await;
    json_response(StatusCode::OK, serde_json::json!(report))
}

async fn stop_all(State(state): State<AdminState>) -> Response {
    let report = state.manager.stop_all().await;
    json_response(StatusCode::OK, serde_json::json!(report))
}

async fn start_worker(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.manager.start_worker(id).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({ "worker_id": id, "start": outcome }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn stop_worker(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.manager.stop_worker(id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "worker_id": id, "status": "stopped" }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn failover_worker(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    info!(worker_id = id, "operator requested failover");
    match state.manager.trigger_failover(id).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({ "worker_id": id, "failover": outcome }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn delete_worker(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.manager.delete_worker(id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "worker_id": id, "status": "deleted" }),
        ),
        Err(e) => error_response(&e),
    }
}

// --- Credentials ---

/// GET /admin/credentials: never exposes secrets.
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let credentials: Vec<serde_json::Value> = state
        .manager
        .pool()
        .credentials()
        .await
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "status": c.status,
                "fingerprint": fingerprint(&c.secret),
                "created_at": c.created_at,
                "note": c.note,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "credentials": credentials }),
    )
}

/// Secrets as a list, as newline-separated text, or both.
#[derive(Deserialize)]
struct AddCredentialsRequest {
    #[serde(default)]
    secrets: Vec<String>,
    #[serde(default)]
    text: Option<String>,
}

async fn add_credentials(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddCredentialsRequest>,
) -> Response {
    let mut secrets = body.secrets;
    if let Some(text) = &body.text {
        secrets.extend(text.lines().map(str::to_string));
    }
    if secrets.iter().all(|s| s.trim().is_empty()) {
        return bad_request("no secrets submitted");
    }

    match state.manager.add_credentials(&secrets).await {
        Ok(report) => json_response(StatusCode::OK, serde_json::json!(report)),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct DeleteCredentialsRequest {
    ids: Vec<u64>,
}

async fn delete_credentials(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<DeleteCredentialsRequest>,
) -> Response {
    match state.manager.delete_credentials(&body.ids).await {
        Ok(report) => json_response(StatusCode::OK, serde_json::json!(report)),
        Err(e) => error_response(&e),
    }
}

async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.manager.pool().health().await)
}

// --- Broadcasts ---

#[derive(Deserialize)]
struct BroadcastRequest {
    text: String,
    #[serde(default)]
    photo_path: Option<PathBuf>,
}

/// POST /admin/broadcast: blocks until every delivery was attempted.
async fn broadcast(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BroadcastRequest>,
) -> Response {
    if body.text.trim().is_empty() {
        return bad_request("broadcast text must not be empty");
    }
    match state
        .manager
        .broadcast(&body.text, body.photo_path.as_deref())
        .await
    {
        Ok(report) => json_response(StatusCode::OK, serde_json::json!(report)),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct GreetingRequest {
    text: String,
}

async fn edit_greetings(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<GreetingRequest>,
) -> Response {
    if body.text.trim().is_empty() {
        return bad_request("greeting text must not be empty");
    }
    let report = state.manager.edit_greetings(&body.text).await;
    json_response(StatusCode::OK, serde_json::json!(report))
}

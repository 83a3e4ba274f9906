//! REST API Handlers
//!
//! Exposes the cluster lifecycle, backups, restores and jobs over HTTP.
//! Long operations (start, backup, restore) answer `202 Accepted` with the id
//! of the job that carries them.

use crate::config::ClusterConfig;
use crate::controlplane::AppsOrchestrator;
use crate::domain::ports::Taint;
use crate::error::Error;
use crate::jobs::JobId;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Backup creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupRequest {
    /// Backup name; defaults to the current timestamp
    #[serde(default)]
    pub name: Option<String>,
}

/// Returned when a long operation was queued
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAcceptedResponse {
    pub job_id: JobId,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaintAddedResponse {
    pub added: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconfigureResponse {
    pub clean_start: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<AppsOrchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<AppsOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Cluster endpoints
            .route("/v1/status", get(cluster_status))
            .route("/v1/cluster/start", post(start_cluster))
            .route("/v1/cluster/stop", post(stop_cluster))
            .route("/v1/config", get(get_config).put(reconfigure))
            // Backup endpoints
            .route("/v1/backups", get(list_backups).post(create_backup))
            .route("/v1/backups/:name", delete(delete_backup))
            .route("/v1/backups/:name/restore", post(restore_backup))
            // Job endpoints
            .route("/v1/jobs", get(list_jobs))
            .route("/v1/jobs/:id", get(get_job))
            .route("/v1/jobs/:id/abort", post(abort_job))
            // Taint endpoints
            .route("/v1/taints", get(list_taints).post(add_taint))
            .route("/v1/taints/:key", delete(remove_taint))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<AppsOrchestrator>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// HTTP status for an error
pub fn status_for(err: &Error) -> StatusCode {
    match err.root() {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Duplicate { .. } | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        Error::Validation(_) | Error::Configuration(_) => StatusCode::BAD_REQUEST,
        Error::LockedResource { .. } => StatusCode::LOCKED,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        debug!(error = %err, "Request rejected");
    }
    (
        status,
        Json(ApiErrorResponse {
            error: err.kind().into(),
            message: err.to_string(),
            details: None,
        }),
    )
        .into_response()
}

fn accepted(job_id: JobId, method: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(JobAcceptedResponse {
            job_id,
            method: method.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Cluster Handlers
// =============================================================================

async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.cluster_status())
}

async fn start_cluster(State(state): State<AppState>) -> impl IntoResponse {
    info!("Cluster start requested");
    let handle = state.orchestrator.start_job();
    accepted(handle.id(), handle.job().method())
}

async fn stop_cluster(State(state): State<AppState>) -> impl IntoResponse {
    info!("Cluster stop requested");
    match state.orchestrator.stop_cluster().await {
        Ok(()) => Json(state.orchestrator.cluster_status()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.config())
}

async fn reconfigure(
    State(state): State<AppState>,
    Json(config): Json<ClusterConfig>,
) -> impl IntoResponse {
    info!("Reconfiguring applications cluster (pool {:?})", config.pool);
    match state.orchestrator.reconfigure(config).await {
        Ok(clean_start) => Json(ReconfigureResponse { clean_start }).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Backup Handlers
// =============================================================================

async fn list_backups(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.list_backups().await {
        Ok(backups) => Json(backups).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_backup(
    State(state): State<AppState>,
    request: Option<Json<CreateBackupRequest>>,
) -> impl IntoResponse {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    info!("Backup requested: {:?}", request.name);
    let handle = state.orchestrator.backup(request.name);
    accepted(handle.id(), handle.job().method())
}

async fn delete_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.delete_backup(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn restore_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    info!("Restore of backup {} requested", name);
    let handle = state.orchestrator.restore(&name);
    accepted(handle.id(), handle.job().method())
}

// =============================================================================
// Job Handlers
// =============================================================================

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.jobs())
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> impl IntoResponse {
    match state.orchestrator.job(id) {
        Some(job) => Json(job).into_response(),
        None => error_response(Error::not_found("Job", id.to_string())),
    }
}

async fn abort_job(State(state): State<AppState>, Path(id): Path<JobId>) -> impl IntoResponse {
    match state.orchestrator.abort_job(id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Taint Handlers
// =============================================================================

async fn list_taints(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.taints().await {
        Ok(taints) => Json(taints).into_response(),
        Err(e) => error_response(e),
    }
}

async fn add_taint(State(state): State<AppState>, Json(taint): Json<Taint>) -> impl IntoResponse {
    match state.orchestrator.add_taint(taint).await {
        Ok(true) => (StatusCode::CREATED, Json(TaintAddedResponse { added: true })).into_response(),
        Ok(false) => Json(TaintAddedResponse { added: false }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_taint(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.remove_taint(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    "ok"
}

/// Ready once the initial status has been discovered
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.orchestrator.cluster_status().status;
    if status == crate::cluster::ClusterStatus::Pending {
        (StatusCode::SERVICE_UNAVAILABLE, "initializing")
    } else {
        (StatusCode::OK, "ok")
    }
}

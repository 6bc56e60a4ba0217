//! Engine control routes.
//!
//! Operational endpoints consumed by the dashboard.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/engine/status` | Per-status counts, optional job list |
//! | POST | `/api/engine/jobs` | Enqueue a job |
//! | GET | `/api/engine/jobs/{id}` | Get a single job |
//! | POST | `/api/engine/jobs/{id}/retry` | Requeue a failed job |
//! | DELETE | `/api/engine/jobs/{id}` | Cancel a pending job |
//! | POST | `/api/engine/force-process` | Dispatch eligible jobs immediately |
//! | POST | `/api/engine/cleanup-stuck` | Reclaim stuck jobs now |
//! | POST | `/api/engine/cleanup` | Delete old terminal jobs |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::{JobCounts, JobDbModel, JobType};
use crate::engine::RetryOutcome;

/// Create the engine control router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/jobs", post(enqueue_job))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .route("/force-process", post(force_process))
        .route("/cleanup-stuck", post(cleanup_stuck))
        .route("/cleanup", post(cleanup_old))
}

/// Query parameters for the status endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StatusParams {
    /// Omit the job list, returning counts only.
    #[serde(default)]
    pub quiet: bool,
}

/// Job representation returned to the dashboard. Leaves out the owner token
/// and raw payload.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub created_at: String,
    pub scheduled_for: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl From<JobDbModel> for JobView {
    fn from(job: JobDbModel) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            scheduled_for: job.scheduled_for,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message,
            result_reference: job.result_reference,
            duration_secs: job.duration_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub stats: JobCounts,
    /// Pending jobs older than the configured stale threshold.
    pub stale_pending: u64,
    /// Mean execution duration across completed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobView>>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ForceProcessResponse {
    pub processed_count: usize,
}

#[derive(Debug, Serialize)]
pub struct CleanupStuckResponse {
    pub reset_count: u64,
    pub failed_count: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupRequest {
    /// Override the configured retention window.
    pub retention_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted_count: u64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    pub message: String,
}

/// Get engine statistics and, unless `quiet=true`, the most recent jobs.
///
/// # Endpoint
///
/// `GET /api/engine/status?quiet=true`
async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Json<StatusResponse>> {
    let status = state
        .engine
        .status(params.quiet)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(StatusResponse {
        stats: status.stats,
        stale_pending: status.stale_pending,
        avg_duration_secs: status.avg_duration_secs,
        jobs: status
            .jobs
            .map(|jobs| jobs.into_iter().map(JobView::from).collect()),
    }))
}

/// Enqueue a new job.
///
/// # Endpoint
///
/// `POST /api/engine/jobs`
///
/// Returns immediately after the store write; execution happens on a later
/// dispatcher tick.
async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<EnqueueResponse>> {
    let job_id = state
        .engine
        .enqueue(request.job_type, request.payload, request.max_attempts)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(EnqueueResponse { job_id }))
}

/// Get a single job by ID.
///
/// # Endpoint
///
/// `GET /api/engine/jobs/{id}`
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = state
        .engine
        .repository()
        .get_job(&id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(JobView::from(job)))
}

/// Requeue a failed job for immediate dispatch.
///
/// # Endpoint
///
/// `POST /api/engine/jobs/{id}/retry`
///
/// Valid from FAILED or RETRY. The attempt count is preserved. Repeating the
/// call against a job that is already pending is a no-op, so the dashboard
/// can safely retry the request itself.
///
/// # Errors
///
/// - `404 Not Found` - no job with the given ID
/// - `409 Conflict` - job is in a status that cannot be requeued
async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AckResponse>> {
    let outcome = state.engine.retry_job(&id).await.map_err(ApiError::from)?;

    let message = match outcome {
        RetryOutcome::Requeued => format!("Job '{}' requeued", id),
        RetryOutcome::AlreadyPending => format!("Job '{}' is already pending", id),
    };
    Ok(Json(AckResponse { ok: true, message }))
}

/// Cancel a pending job.
///
/// # Endpoint
///
/// `DELETE /api/engine/jobs/{id}`
///
/// # Errors
///
/// - `404 Not Found` - no job with the given ID
/// - `409 Conflict` - job is no longer pending; already-claimed jobs cannot
///   be cancelled mid-flight
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AckResponse>> {
    state.engine.cancel_job(&id).await.map_err(ApiError::from)?;

    Ok(Json(AckResponse {
        ok: true,
        message: format!("Job '{}' cancelled", id),
    }))
}

/// Dispatch eligible jobs immediately, bypassing the startup delay.
///
/// # Endpoint
///
/// `POST /api/engine/force-process`
///
/// The concurrency ceiling still applies.
async fn force_process(State(state): State<AppState>) -> ApiResult<Json<ForceProcessResponse>> {
    let processed_count = state.engine.force_process().await.map_err(ApiError::from)?;
    Ok(Json(ForceProcessResponse { processed_count }))
}

/// Run a stuck-job scan immediately.
///
/// # Endpoint
///
/// `POST /api/engine/cleanup-stuck`
async fn cleanup_stuck(State(state): State<AppState>) -> ApiResult<Json<CleanupStuckResponse>> {
    let outcome = state.engine.cleanup_stuck().await.map_err(ApiError::from)?;
    Ok(Json(CleanupStuckResponse {
        reset_count: outcome.reset,
        failed_count: outcome.failed,
    }))
}

/// Delete terminal jobs older than the retention window.
///
/// # Endpoint
///
/// `POST /api/engine/cleanup`
///
/// Only COMPLETED, FAILED and CANCELLED rows are eligible; pending and
/// processing rows are never deleted regardless of age.
async fn cleanup_old(
    State(state): State<AppState>,
    request: Option<Json<CleanupRequest>>,
) -> ApiResult<Json<CleanupResponse>> {
    let retention = request
        .and_then(|Json(r)| r.retention_hours)
        .map(|hours| chrono::Duration::hours(hours as i64));

    let deleted_count = state
        .engine
        .cleanup_old(retention)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(CleanupResponse { deleted_count }))
}

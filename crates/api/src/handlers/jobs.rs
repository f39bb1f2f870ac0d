//! Handlers for the `/jobs` resource.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use kiln_core::error::CoreError;
use kiln_core::job::{JobStatus, JobSummary};
use kiln_core::types::JobId;
use kiln_jobs::JobFilter;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Page size when `limit` is not given.
const DEFAULT_LIMIT: usize = 50;

/// Upper bound for `limit`.
const MAX_LIMIT: usize = 500;

/// Query parameters for `GET /jobs`.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub service: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobListQuery {
    fn into_filter(self) -> JobFilter {
        JobFilter {
            service: self.service,
            status: self.status,
            limit: Some(self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
            offset: self.offset,
        }
    }
}

/// Response body for `POST /jobs/{id}/cancel`.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

fn job_not_found(id: JobId) -> AppError {
    AppError::Core(CoreError::NotFound {
        entity: "Job",
        id: id.to_string(),
    })
}

/// GET /api/v1/jobs
///
/// List job summaries, newest first. Supports `service`, `status`,
/// `limit`, and `offset` query parameters.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs: Vec<JobSummary> = state
        .manager()
        .list_jobs(&params.into_filter())
        .await
        .iter()
        .map(|job| job.summary())
        .collect();

    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/stats
pub async fn job_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = state.manager().stats().await;
    Ok(Json(DataResponse { data: stats }))
}

/// GET /api/v1/jobs/{id}
///
/// Full job view. `result` and `error` appear only once the job is terminal.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .manager()
        .get_job(&job_id)
        .await
        .ok_or_else(|| job_not_found(job_id))?;

    Ok(Json(DataResponse { data: job.view() }))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancel a PENDING or RUNNING job. Cancelling a finished job is not an
/// error; the response reports its current status.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let status = state
        .executor
        .cancel(&job_id)
        .await
        .ok_or_else(|| job_not_found(job_id))?;

    tracing::info!(job_id = %job_id, status = %status, "Job cancel requested");

    Ok(Json(DataResponse {
        data: CancelResponse { job_id, status },
    }))
}

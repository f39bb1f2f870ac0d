//! Handlers for the `/services` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};

use kiln_core::service::ServiceConfig;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for job submission.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// GET /api/v1/services
///
/// Every configured service with its parameter and output descriptors.
pub async fn list_services(State(state): State<AppState>) -> Json<DataResponse<Vec<ServiceConfig>>> {
    let services = state.registry().iter().cloned().collect();
    Json(DataResponse { data: services })
}

/// POST /api/v1/services/{name}/jobs
///
/// Validate parameters and start a job. Returns 202 with the PENDING job;
/// poll `/jobs/{id}` for progress and the result.
pub async fn submit_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<SubmitJobRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.executor.submit(&name, input.parameters).await?;

    tracing::info!(job_id = %job.job_id, service = %name, "Job submitted");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job.view() })))
}

//! Route definitions for the `/services` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::services;
use crate::state::AppState;

/// Routes mounted at `/services`.
///
/// ```text
/// GET    /                -> list_services
/// POST   /{name}/jobs     -> submit_job
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(services::list_services))
        .route("/{name}/jobs", post(services::submit_job))
}

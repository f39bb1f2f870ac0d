pub mod health;
pub mod jobs;
pub mod mcp;
pub mod services;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /services                                        list services
/// /services/{name}/jobs                            submit job (POST)
///
/// /jobs                                            list jobs
/// /jobs/stats                                      counts per status
/// /jobs/{id}                                       get job
/// /jobs/{id}/cancel                                cancel job (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/services", services::router())
        .nest("/jobs", jobs::router())
}

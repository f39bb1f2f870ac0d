use axum::routing::post;
use axum::Router;

use crate::handlers::mcp;
use crate::state::AppState;

/// Mount the agent tool endpoint (root level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/mcp", post(mcp::handle))
}

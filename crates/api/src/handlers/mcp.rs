//! Handler for the agent tool endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::mcp::protocol::{handle_message, RpcResponse, PARSE_ERROR};
use crate::state::AppState;

/// POST /mcp
///
/// One JSON-RPC message per request. Notifications are acknowledged with
/// 202 and no body.
pub async fn handle(State(state): State<AppState>, body: Bytes) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            let response = RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
            return Json(response).into_response();
        }
    };

    match handle_message(&state.tools, &state.executor, raw).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

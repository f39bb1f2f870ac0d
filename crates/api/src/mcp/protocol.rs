//! JSON-RPC 2.0 envelope and method dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::engine::JobExecutor;
use crate::mcp::ToolRegistry;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications, which get no response.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// Parse and answer one raw JSON-RPC message.
///
/// Returns `None` for notifications.
pub async fn handle_message(
    tools: &ToolRegistry,
    executor: &JobExecutor,
    raw: Value,
) -> Option<RpcResponse> {
    let id_hint = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return Some(RpcResponse::failure(
                id_hint,
                INVALID_REQUEST,
                format!("Invalid request: {e}"),
            ))
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        return Some(RpcResponse::failure(
            request.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    let Some(id) = request.id else {
        tracing::debug!(method = %request.method, "Agent notification received");
        return None;
    };

    let response = match request.method.as_str() {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "kiln", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "ping" => RpcResponse::success(id, json!({})),
        "tools/list" => RpcResponse::success(id, json!({ "tools": tools.definitions() })),
        "tools/call" => call_tool(tools, executor, id, request.params).await,
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Unknown method '{other}'")),
    };
    Some(response)
}

async fn call_tool(
    tools: &ToolRegistry,
    executor: &JobExecutor,
    id: Value,
    params: Option<Value>,
) -> RpcResponse {
    let params: CallParams = match params.map(serde_json::from_value) {
        Some(Ok(params)) => params,
        Some(Err(e)) => return RpcResponse::failure(id, INVALID_PARAMS, format!("Invalid params: {e}")),
        None => return RpcResponse::failure(id, INVALID_PARAMS, "Missing params"),
    };

    let Some(tool) = tools.get(&params.name) else {
        return RpcResponse::failure(id, INVALID_PARAMS, format!("Unknown tool '{}'", params.name));
    };

    tracing::info!(tool = %params.name, "Agent tool call");
    let outcome = tool
        .call(executor, params.arguments.unwrap_or_default())
        .await;

    let (text, is_error) = match outcome {
        Ok(value) => (value.to_string(), false),
        Err(e) => {
            tracing::warn!(tool = %params.name, error = %e, "Agent tool call failed");
            (e.to_string(), true)
        }
    };

    RpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }),
    )
}

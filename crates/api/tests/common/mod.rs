#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get as route_get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tower::ServiceExt;

use kiln_api::config::{CleanupConfig, ComfyUIConfig, ServerConfig};
use kiln_api::engine::{BlobRelay, EngineSettings, JobExecutor};
use kiln_api::mcp::ToolRegistry;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_api::workflows::StaticWorkflowSource;
use kiln_cloud::{BlobError, BlobStore, MemoryBlobStore};
use kiln_core::job::JobStatus;
use kiln_core::service::ServiceRegistry;
use kiln_core::workflow::WorkflowGraph;
use kiln_jobs::{CleanupPolicy, JobManager};

// ---------------------------------------------------------------------------
// Fake ComfyUI engine
// ---------------------------------------------------------------------------

/// How the fake engine answers a submitted prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Cached + progress events, a preview node, then the save node.
    /// When `gated`, the save node waits for [`FakeEngine::release`].
    Complete { gated: bool },
    /// Progress, then `execution_error` from the sampler.
    ExecutionError,
    /// Accept the prompt and never send anything.
    Silent,
    /// Reject `POST /prompt` with 400.
    RejectSubmission,
}

struct EngineState {
    script: Script,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    release: Notify,
    prompts: Mutex<Vec<Value>>,
    deleted: Mutex<Vec<String>>,
    interrupted: Mutex<Vec<String>>,
}

/// ComfyUI stand-in on an ephemeral local port.
pub struct FakeEngine {
    pub addr: SocketAddr,
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub async fn start(script: Script) -> Self {
        let state = Arc::new(EngineState {
            script,
            sockets: Mutex::new(HashMap::new()),
            release: Notify::new(),
            prompts: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            interrupted: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/ws", route_get(ws_handler))
            .route("/prompt", post(prompt_handler))
            .route("/view", route_get(view_handler))
            .route("/history/{prompt_id}", route_get(history_handler))
            .route("/queue", post(queue_handler))
            .route("/interrupt", post(interrupt_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Let a gated script send its end-node event.
    pub fn release(&self) {
        self.state.release.notify_one();
    }

    /// Every `POST /prompt` body received so far.
    pub async fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().await.clone()
    }

    /// Prompt ids removed through `POST /queue`.
    pub async fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().await.clone()
    }

    /// Prompt ids sent to `POST /interrupt`.
    pub async fn interrupted(&self) -> Vec<String> {
        self.state.interrupted.lock().await.clone()
    }
}

async fn ws_handler(
    State(state): State<Arc<EngineState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = query.get("clientId").cloned().unwrap_or_default();
    // Registered before the upgrade completes, so a prompt submitted right
    // after connecting always finds its socket.
    let (tx, rx) = mpsc::unbounded_channel();
    state.sockets.lock().await.insert(client_id, tx);
    ws.on_upgrade(move |socket| pump(socket, rx))
}

async fn pump(mut socket: WebSocket, mut rx: mpsc::UnboundedReceiver<String>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": "fake"}});
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }
    while let Some(frame) = rx.recv().await {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
}

async fn prompt_handler(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<Value>,
) -> Response {
    state.prompts.lock().await.push(body.clone());

    if state.script == Script::RejectSubmission {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"type": "prompt_no_outputs"}, "node_errors": {}})),
        )
            .into_response();
    }

    let prompt_id = uuid::Uuid::new_v4().to_string();
    let client_id = body["client_id"].as_str().unwrap_or_default().to_string();
    let sender = state.sockets.lock().await.get(&client_id).cloned();

    if let Some(sender) = sender {
        tokio::spawn(run_script(Arc::clone(&state), sender, prompt_id.clone()));
    }

    Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": {}})).into_response()
}

async fn run_script(state: Arc<EngineState>, tx: mpsc::UnboundedSender<String>, prompt_id: String) {
    let send = |value: Value| {
        let _ = tx.send(value.to_string());
    };
    let pause = || tokio::time::sleep(Duration::from_millis(10));

    match state.script {
        Script::Complete { gated } => {
            send(json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}));
            send(json!({"type": "execution_cached", "data": {"nodes": ["4", "5"], "prompt_id": prompt_id}}));
            send(json!({"type": "executing", "data": {"node": "3", "prompt_id": prompt_id}}));
            pause().await;
            send(json!({"type": "progress", "data": {"value": 10, "max": 20, "node": "3", "prompt_id": prompt_id}}));
            pause().await;
            send(json!({"type": "executing", "data": {"node": "8", "prompt_id": prompt_id}}));
            // A preview node finishing first must not complete the job.
            send(json!({"type": "executed", "data": {
                "node": "10",
                "output": {"images": [{"filename": "preview_00001.png", "subfolder": "", "type": "temp"}]},
                "prompt_id": prompt_id
            }}));
            if gated {
                state.release.notified().await;
            }
            send(json!({"type": "executing", "data": {"node": "9", "prompt_id": prompt_id}}));
            send(json!({"type": "executed", "data": {
                "node": "9",
                "display_node": "9",
                "output": {"images": [{"filename": "kiln_00001.png", "subfolder": "", "type": "output"}]},
                "prompt_id": prompt_id
            }}));
            send(json!({"type": "execution_success", "data": {"prompt_id": prompt_id}}));
        }
        Script::ExecutionError => {
            send(json!({"type": "executing", "data": {"node": "3", "prompt_id": prompt_id}}));
            send(json!({"type": "progress", "data": {"value": 1, "max": 20, "node": "3"}}));
            pause().await;
            send(json!({"type": "execution_error", "data": {
                "prompt_id": prompt_id,
                "node_id": "3",
                "node_type": "KSampler",
                "exception_type": "RuntimeError",
                "exception_message": "CUDA out of memory"
            }}));
        }
        Script::Silent | Script::RejectSubmission => {}
    }
}

async fn view_handler(Query(query): Query<HashMap<String, String>>) -> Response {
    let filename = query.get("filename").cloned().unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "image/png")],
        format!("PNG:{filename}").into_bytes(),
    )
        .into_response()
}

async fn history_handler(Path(prompt_id): Path<String>) -> Json<Value> {
    let mut history = serde_json::Map::new();
    history.insert(
        prompt_id,
        json!({ "outputs": { "4": { "text": ["from cache"] } } }),
    );
    Json(Value::Object(history))
}

async fn queue_handler(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(ids) = body["delete"].as_array() {
        let mut deleted = state.deleted.lock().await;
        deleted.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    StatusCode::OK
}

async fn interrupt_handler(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(id) = body["prompt_id"].as_str() {
        state.interrupted.lock().await.push(id.to_string());
    }
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Blob stores
// ---------------------------------------------------------------------------

/// Rejects every upload.
pub struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn put(
        &self,
        key: &str,
        _bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<String, BlobError> {
        Err(BlobError::Upload {
            key: key.to_string(),
            message: "bucket unavailable".into(),
        })
    }
}

/// Stores into memory but rejects any key ending in `reject`; counts every attempt.
pub struct PartialBlobStore {
    pub inner: MemoryBlobStore,
    reject: String,
    attempts: AtomicUsize,
}

impl PartialBlobStore {
    pub fn rejecting(filename: &str) -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            reject: filename.to_string(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for PartialBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, BlobError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if key.ends_with(&self.reject) {
            return Err(BlobError::Upload {
                key: key.to_string(),
                message: "object rejected".into(),
            });
        }
        self.inner.put(key, bytes, content_type).await
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

pub const SERVICES: &str = r#"{
    "services": [
        {
            "name": "text_to_image",
            "description": "Generate an image from a text prompt",
            "workflow": "text_to_image",
            "parameters": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "6", "input": "text"},
                {"name": "steps", "type": "integer", "default": 20, "node_id": "3", "input": "steps"}
            ]
        },
        {
            "name": "captioned_image",
            "workflow": "text_to_image",
            "parameters": [
                {"name": "prompt", "type": "string", "required": true, "node_id": "6", "input": "text"}
            ],
            "outputs": [
                {"name": "caption", "type": "text", "source": {"node_id": "4"}},
                {"name": "image", "type": "image", "source": {"node_id": "9", "output_type": "images", "index": 0}}
            ]
        }
    ]
}"#;

pub const TEXT_TO_IMAGE: &str = r#"{
    "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 30, "model": ["4", 0]}},
    "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
    "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 512, "height": 512}},
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
    "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0]}},
    "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "kiln", "images": ["8", 0]}},
    "10": {"class_type": "PreviewImage", "inputs": {"images": ["8", 0]}}
}"#;

/// Build a test `ServerConfig` pointing at `comfyui_host`.
pub fn test_config(comfyui_host: &str, timeout: Duration) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        comfyui: ComfyUIConfig {
            host: comfyui_host.to_string(),
            secure: false,
            timeout_secs: timeout.as_secs().max(1),
        },
        services_config: PathBuf::from("config/services.json"),
        workflows_dir: PathBuf::from("workflows"),
        blob: None,
        cleanup: CleanupConfig {
            retention_hours: 24,
            interval_secs: 3600,
            policy: CleanupPolicy::AgeOnly,
        },
        cancel_preemptive: false,
    }
}

/// Options for [`build_test_app`].
pub struct TestApp {
    pub timeout: Duration,
    pub relay: Option<BlobRelay>,
    pub preemptive_cancel: bool,
}

impl Default for TestApp {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            relay: None,
            preemptive_cancel: false,
        }
    }
}

/// Build the full application router against `comfyui_host`.
///
/// Mirrors the construction in `main.rs` so tests exercise the same
/// middleware stack production uses.
pub fn build_test_app(comfyui_host: &str, options: TestApp) -> (Router, AppState) {
    let config = test_config(comfyui_host, options.timeout);
    let registry = Arc::new(ServiceRegistry::from_json(SERVICES).unwrap());
    let workflows = Arc::new(
        StaticWorkflowSource::new().with("text_to_image", WorkflowGraph::from_json(TEXT_TO_IMAGE).unwrap()),
    );

    let mut executor = JobExecutor::new(
        Arc::new(JobManager::new()),
        Arc::clone(&registry),
        workflows,
        EngineSettings {
            host: comfyui_host.to_string(),
            secure: false,
            timeout: options.timeout,
        },
    )
    .with_preemptive_cancel(options.preemptive_cancel);
    if let Some(relay) = options.relay {
        executor = executor.with_blob_relay(relay);
    }

    let state = AppState {
        executor,
        tools: Arc::new(ToolRegistry::for_services(&registry)),
    };

    (build_app_router(state.clone(), &config), state)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `GET /api/v1/jobs/{id}` until `done` accepts the job view.
pub async fn wait_for_job(app: &Router, job_id: &str, done: impl Fn(&Value) -> bool) -> Value {
    let uri = format!("/api/v1/jobs/{job_id}");
    let mut last = Value::Null;
    for _ in 0..250 {
        let response = get(app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        last = body_json(response).await["data"].clone();
        if done(&last) {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached the expected state; last view: {last}");
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(app: &Router, job_id: &str) -> Value {
    wait_for_job(app, job_id, |job| {
        serde_json::from_value::<JobStatus>(job["status"].clone())
            .map(JobStatus::is_terminal)
            .unwrap_or(false)
    })
    .await
}

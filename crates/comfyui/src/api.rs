//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, artifact download (`/view`), history
//! retrieval, queue deletion and interruption using [`reqwest`].

use serde::Deserialize;

use kiln_core::workflow::WorkflowGraph;

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
    /// Per-node validation errors, empty on success.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

impl SubmitResponse {
    /// `true` when the engine flagged at least one node.
    pub fn has_node_errors(&self) -> bool {
        match &self.node_errors {
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        }
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A URL could not be built from the configured host.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ComfyUIApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`] so
    /// every job shares one connection pool.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submit a workflow for execution under `client_id`.
    ///
    /// The engine addresses all WebSocket events for the prompt to the
    /// session opened with the same `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Direct-access URL for an artifact (`GET /view`).
    pub fn view_url(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<String, ComfyUIApiError> {
        reqwest::Url::parse_with_params(
            &format!("{}/view", self.api_url),
            &[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ],
        )
        .map(String::from)
        .map_err(|e| ComfyUIApiError::InvalidUrl(e.to_string()))
    }

    /// Download an artifact's bytes and its content type, if reported.
    pub async fn fetch_view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<(Vec<u8>, Option<String>), ComfyUIApiError> {
        let url = self.view_url(filename, subfolder, folder_type)?;
        let response = Self::ensure_success(self.client.get(url).send().await?).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// The returned JSON is keyed by prompt id and contains every node's
    /// recorded `outputs`, including nodes served from cache.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Remove a queued prompt (`POST /queue {"delete": [...]}`).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt `prompt_id` if it is the one executing.
    ///
    /// Engines without targeted interrupts ignore the body and stop the
    /// current execution.
    pub async fn interrupt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt_id": prompt_id,
        });

        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

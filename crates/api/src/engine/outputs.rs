//! Output Assembler: builds a job's images and declared outputs from the
//! raw node outputs recorded during execution.
//!
//! Nothing in here fails the job. An artifact whose relay fails keeps its
//! direct URL; a declared output that cannot be extracted is left out of
//! the result and logged.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

use kiln_cloud::{artifact_key, BlobStore};
use kiln_comfyui::api::ComfyUIApi;
use kiln_core::job::{Artifact, OutputValue};
use kiln_core::service::{OutputKind, OutputSpec};
use kiln_core::types::JobId;

/// Output key that carries image lists in engine results.
const IMAGES_KEY: &str = "images";

/// Upper bound for one engine fetch (`/view`, `/history`) during assembly.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Copies engine artifacts into a blob store.
#[derive(Clone)]
pub struct BlobRelay {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl BlobRelay {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

/// Images and declared outputs of one job.
#[derive(Debug, Default)]
pub struct AssembledOutputs {
    pub images: Vec<Artifact>,
    /// `None` when the service declares no outputs.
    pub outputs: Option<IndexMap<String, OutputValue>>,
}

pub struct OutputAssembler<'a> {
    api: &'a ComfyUIApi,
    relay: Option<&'a BlobRelay>,
    job_id: JobId,
    prompt_id: &'a str,
    fetch_timeout: Duration,
    /// `/history` entry for the prompt, fetched on first need.
    history: Option<Value>,
}

impl<'a> OutputAssembler<'a> {
    pub fn new(
        api: &'a ComfyUIApi,
        relay: Option<&'a BlobRelay>,
        job_id: JobId,
        prompt_id: &'a str,
    ) -> Self {
        Self {
            api,
            relay,
            job_id,
            prompt_id,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            history: None,
        }
    }

    /// Bound each engine fetch; on expiry the artifact keeps its direct URL.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Assemble everything. `node_outputs` maps node id to its raw
    /// `executed` output, end node included.
    pub async fn assemble(
        &mut self,
        node_outputs: &IndexMap<String, Value>,
        declared: &[OutputSpec],
    ) -> AssembledOutputs {
        let images = self.collect_images(node_outputs).await;

        if declared.is_empty() {
            return AssembledOutputs {
                images,
                outputs: None,
            };
        }

        let mut outputs = IndexMap::with_capacity(declared.len());
        for spec in declared {
            match self.extract(spec, node_outputs, &images).await {
                Ok(value) => {
                    outputs.insert(spec.name.clone(), value);
                }
                Err(reason) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        output = %spec.name,
                        node = %spec.source.node_id,
                        reason = %reason,
                        "Declared output could not be assembled",
                    );
                }
            }
        }

        AssembledOutputs {
            images,
            outputs: Some(outputs),
        }
    }

    /// Every image across all recorded nodes, each exactly once.
    async fn collect_images(&self, node_outputs: &IndexMap<String, Value>) -> Vec<Artifact> {
        let mut images: Vec<Artifact> = Vec::new();
        for (node_id, output) in node_outputs {
            let Some(entries) = output.get(IMAGES_KEY).and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                let Some(artifact) = parse_artifact(entry) else {
                    tracing::debug!(job_id = %self.job_id, node = %node_id, "Skipping malformed image entry");
                    continue;
                };
                if !images.iter().any(|a| same_file(a, &artifact)) {
                    images.push(self.finalize(artifact).await);
                }
            }
        }
        images
    }

    async fn extract(
        &mut self,
        spec: &OutputSpec,
        node_outputs: &IndexMap<String, Value>,
        images: &[Artifact],
    ) -> Result<OutputValue, String> {
        let node_id = spec.source.node_id.as_str();
        let node_output = match node_outputs.get(node_id) {
            Some(output) => output.clone(),
            None => self
                .history_output(node_id)
                .await
                .ok_or_else(|| format!("node {node_id} produced no output"))?,
        };

        let output_type = spec.output_type();
        let field = node_output
            .get(output_type)
            .ok_or_else(|| format!("node {node_id} has no '{output_type}' output"))?;

        let index = spec.source.index.unwrap_or(0);
        let element = match field {
            Value::Array(items) => items
                .get(index)
                .ok_or_else(|| format!("'{output_type}' has no element {index}"))?,
            other => other,
        };

        if spec.kind.is_file() {
            let artifact = parse_artifact(element)
                .ok_or_else(|| format!("'{output_type}' element is not a file reference"))?;
            let artifact = match images.iter().find(|a| same_file(a, &artifact)) {
                Some(done) => done.clone(),
                None => self.finalize(artifact).await,
            };
            return Ok(match spec.kind {
                OutputKind::Video => OutputValue::Video(artifact),
                OutputKind::Audio => OutputValue::Audio(artifact),
                OutputKind::Model => OutputValue::Model(artifact),
                _ => OutputValue::Image(artifact),
            });
        }

        Ok(match spec.kind {
            OutputKind::Json => OutputValue::Json {
                value: element.clone(),
            },
            _ => OutputValue::Text {
                value: match element {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                },
            },
        })
    }

    /// Output of a node that never emitted `executed` (served from cache).
    async fn history_output(&mut self, node_id: &str) -> Option<Value> {
        if self.history.is_none() {
            let fetched = tokio::time::timeout(self.fetch_timeout, self.api.get_history(self.prompt_id))
                .await
                .map_err(|_| format!("timed out after {}ms", self.fetch_timeout.as_millis()))
                .and_then(|r| r.map_err(|e| e.to_string()));
            match fetched {
                Ok(history) => {
                    self.history = Some(history.get(self.prompt_id).cloned().unwrap_or(Value::Null))
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        prompt_id = %self.prompt_id,
                        error = %e,
                        "Failed to fetch execution history",
                    );
                    self.history = Some(Value::Null);
                }
            }
        }
        self.history
            .as_ref()?
            .get("outputs")?
            .get(node_id)
            .cloned()
    }

    /// Attach the direct URL and, when relay is enabled, the blob URL.
    async fn finalize(&self, mut artifact: Artifact) -> Artifact {
        match self
            .api
            .view_url(&artifact.filename, &artifact.subfolder, &artifact.folder_type)
        {
            Ok(url) => artifact.url = Some(url),
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, filename = %artifact.filename, error = %e, "Failed to build artifact URL");
            }
        }

        if let Some(relay) = self.relay {
            match self.relay_artifact(relay, &artifact).await {
                Ok(url) => artifact.blob_url = Some(url),
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        filename = %artifact.filename,
                        error = %e,
                        "Blob relay failed; keeping direct URL",
                    );
                }
            }
        }

        artifact
    }

    async fn relay_artifact(&self, relay: &BlobRelay, artifact: &Artifact) -> Result<String, String> {
        let fetch = self
            .api
            .fetch_view(&artifact.filename, &artifact.subfolder, &artifact.folder_type);
        let (bytes, content_type) = tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .map_err(|_| format!("fetch timed out after {}ms", self.fetch_timeout.as_millis()))?
            .map_err(|e| e.to_string())?;
        let key = artifact_key(&relay.prefix, &self.job_id.to_string(), &artifact.filename);
        relay
            .store
            .put(&key, bytes, content_type.as_deref())
            .await
            .map_err(|e| e.to_string())
    }
}

fn same_file(a: &Artifact, b: &Artifact) -> bool {
    a.filename == b.filename && a.subfolder == b.subfolder && a.folder_type == b.folder_type
}

/// Read `{filename, subfolder, type}` from an engine output entry.
fn parse_artifact(value: &Value) -> Option<Artifact> {
    let artifact: Artifact = serde_json::from_value(value.clone()).ok()?;
    (!artifact.filename.is_empty()).then_some(Artifact {
        url: None,
        blob_url: None,
        ..artifact
    })
}

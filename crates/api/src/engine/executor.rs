//! Job executor: validates a submission, records the job, and runs it in
//! the background.
//!
//! Every accepted job gets its own task and its own
//! [`EventStreamClient`]; jobs share nothing but the [`JobManager`].
//! The task flow is:
//!
//! ```text
//! PENDING -> RUNNING -> open stream (end node) -> track -> assemble -> COMPLETED
//!                                   \-> TIMEOUT | FAILED
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::client::{ClientOptions, EventStreamClient, OpenRequest, StreamError};
use kiln_core::end_node::{resolve_end_node, EndNode, EndNodeRule};
use kiln_core::error::CoreError;
use kiln_core::job::{Job, JobError, JobResult, JobStatus};
use kiln_core::service::{ServiceConfig, ServiceRegistry};
use kiln_core::types::JobId;
use kiln_core::workflow::apply_parameters;
use kiln_jobs::{JobManager, StatusUpdate};

use crate::engine::outputs::{BlobRelay, OutputAssembler};
use crate::engine::tracker::ExecutionTracker;
use crate::workflows::WorkflowSource;

/// Where and how long to run workflows.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub host: String,
    pub secure: bool,
    pub timeout: Duration,
}

impl EngineSettings {
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }
}

type CancelTokens = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

#[derive(Clone)]
pub struct JobExecutor {
    manager: Arc<JobManager>,
    registry: Arc<ServiceRegistry>,
    workflows: Arc<dyn WorkflowSource>,
    engine: EngineSettings,
    http: reqwest::Client,
    relay: Option<BlobRelay>,
    /// Present only when cancellation is preemptive.
    cancel_tokens: Option<CancelTokens>,
}

impl JobExecutor {
    pub fn new(
        manager: Arc<JobManager>,
        registry: Arc<ServiceRegistry>,
        workflows: Arc<dyn WorkflowSource>,
        engine: EngineSettings,
    ) -> Self {
        Self {
            manager,
            registry,
            workflows,
            engine,
            http: reqwest::Client::new(),
            relay: None,
            cancel_tokens: None,
        }
    }

    pub fn with_blob_relay(mut self, relay: BlobRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Make `cancel` stop the engine execution instead of only recording it.
    pub fn with_preemptive_cancel(mut self, enabled: bool) -> Self {
        self.cancel_tokens = enabled.then(CancelTokens::default);
        self
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    /// Accept a job for `service_name` and start it in the background.
    ///
    /// All precondition failures (unknown service, invalid parameters,
    /// broken template) are returned here and no job is created.
    pub async fn submit(
        &self,
        service_name: &str,
        parameters: Map<String, Value>,
    ) -> Result<Job, CoreError> {
        let service = self
            .registry
            .get(service_name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "Service",
                id: service_name.to_string(),
            })?;

        let resolved = service.resolve_parameters(&parameters)?;

        let template = self
            .workflows
            .load(&service.workflow)
            .await
            .map_err(|e| match e {
                CoreError::NotFound { id, .. } => CoreError::Internal(format!(
                    "Service '{}' references missing workflow '{id}'",
                    service.name
                )),
                other => other,
            })?;
        let workflow = apply_parameters(&template, &service, &resolved)?;

        let end_node = resolve_end_node(&workflow, &service.outputs).ok_or_else(|| {
            CoreError::Internal(format!("Workflow '{}' has no nodes", service.workflow))
        })?;

        let job = self
            .manager
            .create_job(&service.name, parameters, workflow)
            .await;

        let token = match &self.cancel_tokens {
            Some(tokens) => {
                let token = CancellationToken::new();
                tokens.lock().await.insert(job.job_id, token.clone());
                Some(token)
            }
            None => None,
        };

        tracing::info!(
            job_id = %job.job_id,
            service = %service.name,
            end_node = %end_node.node_id,
            "Job accepted",
        );

        let executor = self.clone();
        let job_id = job.job_id;
        let task_job = job.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(executor.run(task_job, service, end_node, token));
            if let Err(panic) = run.catch_unwind().await {
                let message = panic_message(panic.as_ref());
                tracing::error!(job_id = %job_id, error = %message, "Job task panicked");
                executor
                    .manager
                    .fail(
                        &job_id,
                        JobStatus::Failed,
                        JobError::new(format!("Unhandled error: {message}"), "INTERNAL_ERROR"),
                    )
                    .await;
            }
            executor.release_token(&job_id).await;
        });

        Ok(job)
    }

    /// Cancel a job. See [`JobManager::cancel`] for the return value.
    pub async fn cancel(&self, id: &JobId) -> Option<JobStatus> {
        let status = self.manager.cancel(id).await?;
        if status == JobStatus::Cancelled {
            if let Some(tokens) = &self.cancel_tokens {
                if let Some(token) = tokens.lock().await.remove(id) {
                    tracing::info!(job_id = %id, "Stopping engine execution for cancelled job");
                    token.cancel();
                }
            }
        }
        Some(status)
    }

    // ---- background task ----

    async fn run(
        &self,
        job: Job,
        service: ServiceConfig,
        end_node: EndNode,
        token: Option<CancellationToken>,
    ) {
        let job_id = job.job_id;
        if !self
            .manager
            .update_status(&job_id, JobStatus::Running, StatusUpdate::default())
            .await
        {
            tracing::info!(job_id = %job_id, "Job left PENDING before it started; not executing");
            return;
        }
        let started = Instant::now();

        if end_node.rule == EndNodeRule::LastNode {
            tracing::warn!(
                job_id = %job_id,
                end_node = %end_node.node_id,
                "No output or save node found; waiting on the last node of the workflow",
            );
        }

        match self.execute(&job, &service, &end_node, token).await {
            Ok(mut result) => {
                result.execution_time_ms = (started.elapsed().as_millis() as u64).max(1);
                if self.is_cancelled(&job_id).await {
                    tracing::info!(job_id = %job_id, "Job finished after cancellation; result discarded");
                    return;
                }
                let images = result.images.len();
                let elapsed_ms = result.execution_time_ms;
                if self.manager.complete(&job_id, result).await {
                    tracing::info!(job_id = %job_id, images, elapsed_ms, "Job completed");
                }
            }
            Err(e) => self.record_failure(&job_id, e).await,
        }
    }

    async fn execute(
        &self,
        job: &Job,
        service: &ServiceConfig,
        end_node: &EndNode,
        token: Option<CancellationToken>,
    ) -> Result<JobResult, StreamError> {
        let options = ClientOptions {
            host: self.engine.host.clone(),
            secure: self.engine.secure,
            client_id: job.client_id.clone(),
            timeout: self.engine.timeout,
        };
        let mut client = EventStreamClient::with_http_client(options, self.http.clone())?;
        if let Some(token) = token {
            client = client.with_cancellation(token);
        }

        let events = client.subscribe();
        let tracker = ExecutionTracker::new(job.job_id, Arc::clone(&self.manager));
        let request = OpenRequest {
            workflow: &job.workflow,
            end_node_id: &end_node.node_id,
        };

        let (outcome, mut tracked) = tokio::join!(client.open(request), tracker.drain(events));
        let outcome = outcome?;

        tracked
            .node_outputs
            .insert(outcome.executed.node.clone(), outcome.executed.output.clone());

        let api = ComfyUIApi::with_client(self.http.clone(), self.engine.http_base());
        let assembled = OutputAssembler::new(&api, self.relay.as_ref(), job.job_id, &outcome.prompt_id)
            .assemble(&tracked.node_outputs, &service.outputs)
            .await;

        Ok(JobResult {
            images: assembled.images,
            outputs: assembled.outputs,
            node: outcome.executed.node,
            display_node: outcome.executed.display_node,
            prompt_id: outcome.prompt_id,
            execution_time_ms: 0,
            node_history: tracked.node_history,
        })
    }

    async fn record_failure(&self, job_id: &JobId, error: StreamError) {
        let status = match &error {
            StreamError::Cancelled => {
                tracing::info!(job_id = %job_id, "Engine execution stopped after cancellation");
                return;
            }
            StreamError::Timeout(_) => JobStatus::Timeout,
            _ => JobStatus::Failed,
        };

        tracing::error!(job_id = %job_id, code = error.code(), error = %error, "Job failed");
        self.manager
            .fail(job_id, status, JobError::new(error.to_string(), error.code()))
            .await;
    }

    async fn is_cancelled(&self, job_id: &JobId) -> bool {
        self.manager
            .get_job(job_id)
            .await
            .is_some_and(|job| job.status == JobStatus::Cancelled)
    }

    async fn release_token(&self, job_id: &JobId) {
        if let Some(tokens) = &self.cancel_tokens {
            tokens.lock().await.remove(job_id);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

//! Job entity model and the views handed to callers.
//!
//! A [`Job`] is one tracked asynchronous execution of a workflow. Its
//! lifecycle is governed by [`JobStatus::can_transition_to`]; the job
//! manager is the only component that mutates records.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};
use crate::workflow::WorkflowGraph;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Job execution status.
///
/// ```text
/// PENDING --> RUNNING --> COMPLETED | FAILED | TIMEOUT
/// PENDING | RUNNING --> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Cancelled,
    ];

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress / history
// ---------------------------------------------------------------------------

/// Latest known progress snapshot. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Current step reported by the engine.
    pub value: u32,
    /// Total number of steps for the active node.
    pub max: u32,
    /// Node currently executing, if known.
    pub node: Option<String>,
    /// Nodes whose outputs were served from the engine cache.
    pub cached_nodes: Vec<String>,
    pub updated_at: Timestamp,
}

impl JobProgress {
    /// Completion percentage (0-100) of the active node.
    pub fn percent(&self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        ((u64::from(self.value.min(self.max)) * 100) / u64::from(self.max)) as u8
    }
}

/// One node execution observed on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub at: Timestamp,
    /// `true` when the engine reused a cached output instead of running the node.
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// Result / error payloads
// ---------------------------------------------------------------------------

/// A file produced by the engine (image, video, audio, model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Engine folder type (`output`, `temp`, `input`).
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
    /// Direct-access URL on the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Public URL after relay to the blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_url: Option<String>,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// A named, structured output assembled from the engine result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputValue {
    Image(Artifact),
    Video(Artifact),
    Audio(Artifact),
    Model(Artifact),
    Text { value: String },
    Json { value: serde_json::Value },
}

/// Result of a completed job. Attached exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Every image the run produced, across all nodes.
    pub images: Vec<Artifact>,
    /// Outputs declared by the service, keyed by output name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<IndexMap<String, OutputValue>>,
    /// Node whose `executed` event completed the job.
    pub node: String,
    pub display_node: Option<String>,
    pub prompt_id: String,
    /// Milliseconds from the RUNNING transition to result availability.
    pub execution_time_ms: u64,
    pub node_history: Vec<NodeExecution>,
}

/// Error recorded on a FAILED or TIMEOUT job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The unit of asynchronous work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: JobId,
    pub service: String,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Correlates the job with its engine streaming session.
    pub client_id: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub workflow: WorkflowGraph,
    pub progress: Option<JobProgress>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
}

impl Job {
    /// Build a fresh PENDING job with newly allocated identifiers.
    pub fn new(
        service: impl Into<String>,
        parameters: serde_json::Map<String, serde_json::Value>,
        workflow: WorkflowGraph,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::now_v7(),
            service: service.into(),
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            client_id: uuid::Uuid::new_v4().to_string(),
            parameters,
            workflow,
            progress: None,
            result: None,
            error: None,
        }
    }

    /// Caller-facing view. Terminal payloads appear only once the job is terminal.
    pub fn view(&self) -> JobView {
        let terminal = self.status.is_terminal();
        JobView {
            job_id: self.job_id,
            service: self.service.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            parameters: self.parameters.clone(),
            progress: self.progress.clone(),
            result: self.result.clone().filter(|_| terminal),
            error: self.error.clone().filter(|_| terminal),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            service: self.service.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            percent: self.progress.as_ref().map(JobProgress::percent),
        }
    }
}

/// Full job view returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub service: String,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Compact row returned by list queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub service: String,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub percent: Option<u8>,
}

//! Execution Tracker: turns one job's forwarded stream events into job
//! progress updates and a node-execution log.
//!
//! The tracker drains the receiver returned by
//! [`EventStreamClient::subscribe`](kiln_comfyui::client::EventStreamClient::subscribe)
//! while `open` runs; the channel closes when the client settles, which
//! ends [`ExecutionTracker::drain`].

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;

use kiln_comfyui::events::ExecutionEvent;
use kiln_core::job::{JobProgress, NodeExecution};
use kiln_core::types::JobId;
use kiln_jobs::JobManager;

/// What the tracker observed by the time the stream settled.
#[derive(Debug, Default)]
pub struct TrackedExecution {
    /// Every node execution in arrival order, cached ones included.
    pub node_history: Vec<NodeExecution>,
    /// Raw `output` of every non-end node that reported `executed`.
    pub node_outputs: IndexMap<String, Value>,
}

pub struct ExecutionTracker {
    job_id: JobId,
    manager: Arc<JobManager>,
    observed: TrackedExecution,
    cached_nodes: Vec<String>,
    current_node: Option<String>,
    step: (u32, u32),
}

impl ExecutionTracker {
    pub fn new(job_id: JobId, manager: Arc<JobManager>) -> Self {
        Self {
            job_id,
            manager,
            observed: TrackedExecution::default(),
            cached_nodes: Vec::new(),
            current_node: None,
            step: (0, 0),
        }
    }

    /// Apply events until the sender side closes.
    pub async fn drain(mut self, mut events: mpsc::UnboundedReceiver<ExecutionEvent>) -> TrackedExecution {
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        self.observed
    }

    pub async fn apply(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Progress(data) => {
                if data.node.is_some() {
                    self.current_node = data.node;
                }
                self.step = (data.value, data.max);
                self.publish().await;
            }
            ExecutionEvent::Cached(data) => {
                // One batch, one timestamp.
                let at = chrono::Utc::now();
                for node_id in &data.nodes {
                    self.observed.node_history.push(NodeExecution {
                        node_id: node_id.clone(),
                        at,
                        cached: true,
                    });
                }
                tracing::debug!(job_id = %self.job_id, count = data.nodes.len(), "Nodes served from cache");
                self.cached_nodes.extend(data.nodes);
                self.publish().await;
            }
            ExecutionEvent::Executing(data) => {
                let Some(node_id) = data.node else {
                    return;
                };
                self.observed.node_history.push(NodeExecution {
                    node_id: node_id.clone(),
                    at: chrono::Utc::now(),
                    cached: false,
                });
                self.current_node = Some(node_id);
                self.step = (0, 0);
                self.publish().await;
            }
            ExecutionEvent::Executed(data) => {
                self.observed.node_outputs.insert(data.node, data.output);
            }
        }
    }

    async fn publish(&self) {
        let progress = JobProgress {
            value: self.step.0,
            max: self.step.1,
            node: self.current_node.clone(),
            cached_nodes: self.cached_nodes.clone(),
            updated_at: chrono::Utc::now(),
        };
        self.manager.update_progress(&self.job_id, progress).await;
    }
}

//! Job Manager: sole authority over job state.
//!
//! Every mutation goes through a method here. Updates addressed to an
//! unknown job id are logged and dropped, never fatal: late events for a
//! job removed by cleanup must not take the process down.

use tokio::sync::RwLock;

use kiln_core::job::{Job, JobError, JobProgress, JobResult, JobStatus};
use kiln_core::types::{JobId, Timestamp};
use kiln_core::workflow::WorkflowGraph;

use crate::store::{CleanupPolicy, JobFilter, JobStats, JobStore};

/// Optional fields merged alongside a status transition.
///
/// Unset timestamps are stamped automatically: `started_at` on the move to
/// RUNNING, `completed_at` on any terminal status.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
pub struct JobManager {
    store: RwLock<JobStore>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate ids, store a PENDING job and return a copy of it.
    pub async fn create_job(
        &self,
        service: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
        workflow: WorkflowGraph,
    ) -> Job {
        let job = Job::new(service, parameters, workflow);
        self.store.write().await.insert(job.clone());
        tracing::info!(job_id = %job.job_id, service = %service, "Job created");
        job
    }

    pub async fn get_job(&self, id: &JobId) -> Option<Job> {
        self.store.read().await.get(id).cloned()
    }

    /// Apply a status transition. Returns `false` when nothing changed.
    pub async fn update_status(&self, id: &JobId, status: JobStatus, update: StatusUpdate) -> bool {
        let mut store = self.store.write().await;
        let Some(job) = store.get_mut(id) else {
            tracing::warn!(job_id = %id, status = %status, "Status update for unknown job ignored");
            return false;
        };
        transition(job, status, update)
    }

    /// Replace the progress snapshot. Silently ignored for unknown jobs.
    pub async fn update_progress(&self, id: &JobId, progress: JobProgress) {
        if let Some(job) = self.store.write().await.get_mut(id) {
            job.progress = Some(progress);
        }
    }

    /// Attach a result without touching status.
    pub async fn set_result(&self, id: &JobId, result: JobResult) -> bool {
        let mut store = self.store.write().await;
        let Some(job) = store.get_mut(id) else {
            tracing::warn!(job_id = %id, "Result for unknown job ignored");
            return false;
        };
        if job.result.is_some() || job.error.is_some() {
            tracing::warn!(job_id = %id, "Job already carries a terminal payload; result ignored");
            return false;
        }
        job.result = Some(result);
        true
    }

    /// Attach an error without touching status.
    pub async fn set_error(&self, id: &JobId, error: JobError) -> bool {
        let mut store = self.store.write().await;
        let Some(job) = store.get_mut(id) else {
            tracing::warn!(job_id = %id, "Error for unknown job ignored");
            return false;
        };
        if job.result.is_some() || job.error.is_some() {
            tracing::warn!(job_id = %id, "Job already carries a terminal payload; error ignored");
            return false;
        }
        job.error = Some(error);
        true
    }

    /// Attach `result` and flip to COMPLETED under one write lock.
    ///
    /// Readers never observe COMPLETED without a result. A job cancelled
    /// while running keeps its CANCELLED status and the result is dropped.
    pub async fn complete(&self, id: &JobId, result: JobResult) -> bool {
        let mut store = self.store.write().await;
        let Some(job) = store.get_mut(id) else {
            tracing::warn!(job_id = %id, "Completion for unknown job ignored");
            return false;
        };
        if !job.status.can_transition_to(JobStatus::Completed) {
            tracing::warn!(
                job_id = %id,
                status = %job.status,
                "Completion refused; job is no longer running",
            );
            return false;
        }
        job.result = Some(result);
        transition(job, JobStatus::Completed, StatusUpdate::default())
    }

    /// Attach `error` and flip to `status` (FAILED or TIMEOUT) atomically.
    pub async fn fail(&self, id: &JobId, status: JobStatus, error: JobError) -> bool {
        let mut store = self.store.write().await;
        let Some(job) = store.get_mut(id) else {
            tracing::warn!(job_id = %id, "Failure for unknown job ignored");
            return false;
        };
        if !job.status.can_transition_to(status) {
            tracing::warn!(
                job_id = %id,
                from = %job.status,
                to = %status,
                error = %error.message,
                "Failure refused by state machine",
            );
            return false;
        }
        job.error = Some(error);
        transition(job, status, StatusUpdate::default())
    }

    /// Request cancellation.
    ///
    /// Returns the status after the request, or `None` for an unknown job.
    /// Terminal jobs are left untouched and report their current status.
    pub async fn cancel(&self, id: &JobId) -> Option<JobStatus> {
        let mut store = self.store.write().await;
        let job = store.get_mut(id)?;
        if !job.status.is_terminal() {
            transition(job, JobStatus::Cancelled, StatusUpdate::default());
        }
        Some(job.status)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.store
            .read()
            .await
            .list(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Delete jobs created before `cutoff`, returning how many went.
    pub async fn cleanup_older_than(&self, cutoff: Timestamp, policy: CleanupPolicy) -> usize {
        self.store.write().await.delete_older_than(cutoff, policy)
    }

    pub async fn stats(&self) -> JobStats {
        self.store.read().await.count_by_status()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }
}

fn transition(job: &mut Job, status: JobStatus, update: StatusUpdate) -> bool {
    if !job.status.can_transition_to(status) {
        tracing::warn!(
            job_id = %job.job_id,
            from = %job.status,
            to = %status,
            "Illegal status transition ignored",
        );
        return false;
    }

    let now = chrono::Utc::now();
    if status == JobStatus::Running {
        job.started_at = Some(update.started_at.unwrap_or(now));
    } else if let Some(started_at) = update.started_at {
        job.started_at = Some(started_at);
    }
    if status.is_terminal() {
        job.completed_at = Some(update.completed_at.unwrap_or(now));
    }

    tracing::info!(job_id = %job.job_id, from = %job.status, to = %status, "Job status changed");
    job.status = status;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    fn result() -> JobResult {
        JobResult {
            images: vec![],
            outputs: None,
            node: "9".into(),
            display_node: Some("9".into()),
            prompt_id: "p1".into(),
            execution_time_ms: 12,
            node_history: vec![],
        }
    }

    async fn running_job(manager: &JobManager) -> JobId {
        let job = manager
            .create_job("svc", Default::default(), WorkflowGraph::default())
            .await;
        assert!(
            manager
                .update_status(&job.job_id, JobStatus::Running, StatusUpdate::default())
                .await
        );
        job.job_id
    }

    #[tokio::test]
    async fn create_then_get_returns_pending_job() {
        let manager = JobManager::new();
        let job = manager
            .create_job("svc", Default::default(), WorkflowGraph::default())
            .await;
        let stored = manager.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.client_id, job.client_id);
    }

    #[tokio::test]
    async fn running_transition_stamps_started_at() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        let job = manager.get_job(&id).await.unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn unknown_job_updates_are_noops() {
        let manager = JobManager::new();
        let id = JobId::now_v7();
        assert!(
            !manager
                .update_status(&id, JobStatus::Running, StatusUpdate::default())
                .await
        );
        manager
            .update_progress(
                &id,
                JobProgress {
                    value: 1,
                    max: 2,
                    node: None,
                    cached_nodes: vec![],
                    updated_at: Utc::now(),
                },
            )
            .await;
        assert!(!manager.complete(&id, result()).await);
        assert!(manager.cancel(&id).await.is_none());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn terminal_status_never_changes() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        assert!(manager.complete(&id, result()).await);
        assert!(
            !manager
                .update_status(&id, JobStatus::Failed, StatusUpdate::default())
                .await
        );
        assert!(
            !manager
                .fail(&id, JobStatus::Timeout, JobError::new("late", "TIMEOUT"))
                .await
        );
        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn pending_cannot_complete() {
        let manager = JobManager::new();
        let job = manager
            .create_job("svc", Default::default(), WorkflowGraph::default())
            .await;
        assert!(!manager.complete(&job.job_id, result()).await);
        let job = manager.get_job(&job.job_id).await.unwrap();
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn set_result_does_not_change_status() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        assert!(manager.set_result(&id, result()).await);
        assert_eq!(manager.get_job(&id).await.unwrap().status, JobStatus::Running);
        assert!(!manager.set_error(&id, JobError::new("x", "EXECUTION_ERROR")).await);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        assert_eq!(manager.cancel(&id).await, Some(JobStatus::Cancelled));
        assert_eq!(manager.cancel(&id).await, Some(JobStatus::Cancelled));

        // Late completion after cancellation leaves the job cancelled.
        assert!(!manager.complete(&id, result()).await);
        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn cancel_on_completed_reports_current_status() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        manager.complete(&id, result()).await;
        assert_matches!(manager.cancel(&id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn fail_records_error_and_status_together() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        assert!(
            manager
                .fail(&id, JobStatus::Timeout, JobError::new("Execution timed out after 5ms", "TIMEOUT"))
                .await
        );
        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.error.unwrap().code.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn cleanup_and_stats() {
        let manager = JobManager::new();
        let id = running_job(&manager).await;
        manager
            .create_job("svc", Default::default(), WorkflowGraph::default())
            .await;

        let stats = manager.stats().await;
        assert_eq!((stats.total, stats.running, stats.pending), (2, 1, 1));

        let future_cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(
            manager
                .cleanup_older_than(future_cutoff, CleanupPolicy::SkipActive)
                .await,
            0
        );
        assert_eq!(
            manager
                .cleanup_older_than(future_cutoff, CleanupPolicy::AgeOnly)
                .await,
            2
        );
        assert!(manager.get_job(&id).await.is_none());
    }

    #[tokio::test]
    async fn list_jobs_applies_filter() {
        let manager = JobManager::new();
        manager
            .create_job("a", Default::default(), WorkflowGraph::default())
            .await;
        manager
            .create_job("b", Default::default(), WorkflowGraph::default())
            .await;
        let filter = JobFilter {
            service: Some("b".into()),
            ..Default::default()
        };
        let jobs = manager.list_jobs(&filter).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].service, "b");
    }
}

//! Periodic removal of old job records.
//!
//! Runs on a fixed interval using `tokio::time::interval` and deletes every
//! job created before `now - retention` that the configured
//! [`CleanupPolicy`] allows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use kiln_jobs::{CleanupPolicy, JobManager};

/// Schedule for the cleanup loop.
#[derive(Debug, Clone)]
pub struct CleanupSchedule {
    pub retention: chrono::Duration,
    pub interval: Duration,
    pub policy: CleanupPolicy,
}

/// Run the job cleanup loop until `cancel` is triggered.
pub async fn run(manager: Arc<JobManager>, schedule: CleanupSchedule, cancel: CancellationToken) {
    tracing::info!(
        retention_hours = schedule.retention.num_hours(),
        interval_secs = schedule.interval.as_secs(),
        policy = ?schedule.policy,
        "Job cleanup task started"
    );

    let mut interval = tokio::time::interval(schedule.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job cleanup task stopping");
                break;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now() - schedule.retention;
                let deleted = manager.cleanup_older_than(cutoff, schedule.policy).await;
                if deleted > 0 {
                    tracing::info!(deleted, "Job cleanup: removed expired jobs");
                } else {
                    tracing::debug!("Job cleanup: nothing to remove");
                }
            }
        }
    }
}

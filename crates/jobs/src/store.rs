//! Job Store: keyed repository of job records.
//!
//! No behaviour beyond bookkeeping. Listing always applies
//! filter -> sort (newest `created_at` first) -> offset -> limit, in that
//! fixed order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use kiln_core::job::{Job, JobStatus};
use kiln_core::types::{JobId, Timestamp};

/// Listing filters. All fields optional; `limit: None` returns everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub service: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Which jobs an age-based sweep may delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Delete every job older than the cutoff, whatever its status.
    #[default]
    AgeOnly,
    /// Keep PENDING and RUNNING jobs regardless of age.
    SkipActive,
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
}

impl JobStats {
    fn record(&mut self, status: JobStatus) {
        self.total += 1;
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Timeout => &mut self.timeout,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Insert or replace a record, returning the previous one.
    pub fn insert(&mut self, job: Job) -> Option<Job> {
        self.jobs.insert(job.job_id, job)
    }

    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        self.jobs.remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Filter, then sort newest first, then paginate.
    ///
    /// Ties on `created_at` are broken by the time-ordered job id so
    /// pagination stays stable between calls.
    pub fn list(&self, filter: &JobFilter) -> Vec<&Job> {
        let mut matched: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| {
                filter
                    .service
                    .as_deref()
                    .map_or(true, |service| job.service == service)
            })
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .collect();

        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });

        matched
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn count_by_status(&self) -> JobStats {
        let mut stats = JobStats::default();
        for job in self.jobs.values() {
            stats.record(job.status);
        }
        stats
    }

    /// Delete every job created strictly before `cutoff` that `policy` allows.
    ///
    /// Returns the number of deleted records.
    pub fn delete_older_than(&mut self, cutoff: Timestamp, policy: CleanupPolicy) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            let expired = job.created_at < cutoff;
            let protected = policy == CleanupPolicy::SkipActive && !job.status.is_terminal();
            !expired || protected
        });
        before - self.jobs.len()
    }
}

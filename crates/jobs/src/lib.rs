//! In-memory job tracking.
//!
//! [`store::JobStore`] is the plain keyed repository; [`manager::JobManager`]
//! wraps it behind a lock and is the only component allowed to change a
//! job's status or attach its terminal payload.

pub mod manager;
pub mod store;

pub use manager::{JobManager, StatusUpdate};
pub use store::{CleanupPolicy, JobFilter, JobStats, JobStore};

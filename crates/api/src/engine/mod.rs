//! Job orchestration engine.
//!
//! [`executor::JobExecutor`] accepts submissions and runs each job on its
//! own task. The task follows the engine's event stream through
//! [`tracker::ExecutionTracker`] and builds the result with
//! [`outputs::OutputAssembler`].

pub mod executor;
pub mod outputs;
pub mod tracker;

pub use executor::{EngineSettings, JobExecutor};
pub use outputs::BlobRelay;

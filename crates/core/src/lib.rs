//! Domain types shared across the kiln workspace.
//!
//! Nothing in this crate performs I/O: it holds the job model, the
//! service descriptors loaded from configuration, the workflow graph
//! representation, and the pure functions that operate on them
//! (parameter substitution and end-node resolution).

pub mod end_node;
pub mod error;
pub mod job;
pub mod service;
pub mod types;
pub mod workflow;

//! Kiln API server library.
//!
//! Exposes configuration, state, the orchestration engine, and the HTTP
//! and agent-tool surfaces so integration tests and the binary entrypoint
//! share the same building blocks.

pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod workflows;

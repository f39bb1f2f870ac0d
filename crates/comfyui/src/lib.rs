//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, HTTP API wrappers, and the
//! per-execution [`client::EventStreamClient`] that submits one workflow
//! and follows its event stream until the configured end node reports
//! completion.

pub mod api;
pub mod client;
pub mod events;
pub mod messages;

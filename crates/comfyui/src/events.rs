//! Events forwarded from an execution's stream to its listeners.
//!
//! Only non-terminal traffic is forwarded. The end node's `executed`
//! event and error frames settle [`EventStreamClient::open`] instead.
//!
//! [`EventStreamClient::open`]: crate::client::EventStreamClient::open

use crate::messages::{ExecutedData, ExecutingData, ExecutionCachedData, ProgressData};

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Step-level progress within a node.
    Progress(ProgressData),

    /// A batch of nodes served from cache.
    Cached(ExecutionCachedData),

    /// A node started executing.
    Executing(ExecutingData),

    /// A node other than the end node finished with output.
    Executed(ExecutedData),
}

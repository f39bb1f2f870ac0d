use std::sync::Arc;

use kiln_core::service::ServiceRegistry;
use kiln_jobs::JobManager;

use crate::engine::JobExecutor;
use crate::mcp::ToolRegistry;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Accepts and runs jobs; owns the job manager and service registry.
    pub executor: JobExecutor,
    /// Tools exposed on the agent endpoint.
    pub tools: Arc<ToolRegistry>,
}

impl AppState {
    pub fn manager(&self) -> &Arc<JobManager> {
        self.executor.manager()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.executor.registry()
    }
}

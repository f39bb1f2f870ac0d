//! Agent tool-invocation surface.
//!
//! A small JSON-RPC 2.0 dialect (`initialize`, `tools/list`, `tools/call`)
//! over a single POST endpoint. Tools live on an explicit [`ToolRegistry`]
//! built at startup: one tool per configured service plus the job tools.

pub mod protocol;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use kiln_core::service::ServiceRegistry;

use crate::engine::JobExecutor;
use crate::error::AppError;

/// Tool metadata returned by `tools/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A failed tool call, reported to the agent as `isError` content.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ToolError(pub String);

/// Same client-safe message the REST surface returns.
impl From<kiln_core::error::CoreError> for ToolError {
    fn from(err: kiln_core::error::CoreError) -> Self {
        let (_, _, message) = AppError::from(err).classify();
        ToolError(message)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(
        &self,
        executor: &JobExecutor,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError>;
}

/// Named tools in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a submit tool per service and the job tools.
    pub fn for_services(services: &ServiceRegistry) -> Self {
        let mut registry = Self::new();
        for service in services.iter() {
            registry.register(tools::ServiceTool::new(service.clone()));
        }
        registry.register(tools::GetJobTool);
        registry.register(tools::ListJobsTool);
        registry.register(tools::CancelJobTool);
        registry
    }

    /// Add a tool. A later registration under the same name replaces the
    /// earlier one; service names never collide with the job tools because
    /// the service registry rejects them.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

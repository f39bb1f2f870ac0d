//! Workflow template loading.
//!
//! Templates are stored as ComfyUI API-format JSON. The orchestration engine
//! always works on a copy; nothing here hands out mutable access to a
//! stored template.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use kiln_core::error::CoreError;
use kiln_core::workflow::WorkflowGraph;

/// Source of workflow templates keyed by template id.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, template_id: &str) -> Result<WorkflowGraph, CoreError>;
}

/// Reads `<dir>/<template_id>.json` on every load.
#[derive(Debug, Clone)]
pub struct FileWorkflowSource {
    dir: PathBuf,
}

impl FileWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl WorkflowSource for FileWorkflowSource {
    async fn load(&self, template_id: &str) -> Result<WorkflowGraph, CoreError> {
        validate_template_id(template_id)?;
        let path = self.dir.join(format!("{template_id}.json"));

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound {
                    entity: "Workflow",
                    id: template_id.to_string(),
                });
            }
            Err(e) => {
                return Err(CoreError::Internal(format!(
                    "Failed to read workflow {}: {e}",
                    path.display()
                )));
            }
        };

        WorkflowGraph::from_json(&text).map_err(|e| {
            CoreError::Internal(format!("Workflow '{template_id}' is not valid: {e}"))
        })
    }
}

/// Templates held in memory, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkflowSource {
    templates: HashMap<String, WorkflowGraph>,
}

impl StaticWorkflowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, template_id: impl Into<String>, graph: WorkflowGraph) -> Self {
        self.templates.insert(template_id.into(), graph);
        self
    }
}

#[async_trait]
impl WorkflowSource for StaticWorkflowSource {
    async fn load(&self, template_id: &str) -> Result<WorkflowGraph, CoreError> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "Workflow",
                id: template_id.to_string(),
            })
    }
}

/// Template ids are bare file stems: no separators, no parent references.
fn validate_template_id(template_id: &str) -> Result<(), CoreError> {
    if template_id.is_empty()
        || template_id.contains(['/', '\\'])
        || template_id.contains("..")
    {
        return Err(CoreError::Validation(format!(
            "Invalid workflow template id '{template_id}'"
        )));
    }
    Ok(())
}

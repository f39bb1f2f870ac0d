//! Workflow graph representation and parameter substitution.
//!
//! A workflow graph maps node ids to node records in ComfyUI's API
//! format (`{"6": {"class_type": "CLIPTextEncode", "inputs": {...}}}`).
//! The core treats node contents as opaque apart from `inputs` (which
//! parameters are written into) and `class_type` (which the end-node
//! resolver scans).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::service::ServiceConfig;

/// A single node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub class_type: String,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Any other fields present in the template, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            inputs: Map::new(),
            class_type: class_type.into(),
            meta: None,
            extra: Map::new(),
        }
    }
}

/// Node-id keyed workflow graph. Document order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph(IndexMap<String, WorkflowNode>);

impl WorkflowGraph {
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Invalid workflow graph: {e}")))
    }

    pub fn insert(&mut self, node_id: impl Into<String>, node: WorkflowNode) {
        self.0.insert(node_id.into(), node);
    }

    pub fn get(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.0.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut WorkflowNode> {
        self.0.get_mut(node_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nodes in natural key order: canonical integer ids ascending by value,
    /// followed by every other id in document order. This is the order a
    /// JSON object's keys enumerate in the engine's own tooling, so "first"
    /// and "last" node mean the same thing here as there.
    pub fn nodes_in_order(&self) -> Vec<(&str, &WorkflowNode)> {
        let mut indexed: Vec<(u32, &str, &WorkflowNode)> = Vec::new();
        let mut named: Vec<(&str, &WorkflowNode)> = Vec::new();
        for (id, node) in &self.0 {
            match array_index(id) {
                Some(n) => indexed.push((n, id.as_str(), node)),
                None => named.push((id.as_str(), node)),
            }
        }
        indexed.sort_by_key(|(n, _, _)| *n);
        indexed
            .into_iter()
            .map(|(_, id, node)| (id, node))
            .chain(named)
            .collect()
    }
}

/// Parse a key that would enumerate as an integer index: no sign, no
/// leading zeros (except `"0"` itself), below `u32::MAX`.
fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse::<u32>().ok().filter(|n| *n != u32::MAX)
}

/// Produce the submission graph for one job: a copy of `template` with
/// every resolved parameter written into its target node input.
///
/// `resolved` must come from [`ServiceConfig::resolve_parameters`].
pub fn apply_parameters(
    template: &WorkflowGraph,
    service: &ServiceConfig,
    resolved: &Map<String, Value>,
) -> Result<WorkflowGraph, CoreError> {
    let mut graph = template.clone();

    for spec in &service.parameters {
        let Some(value) = resolved.get(&spec.name) else {
            continue;
        };
        let node = graph.get_mut(&spec.node_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "Service '{}' parameter '{}' targets node '{}' which is not in workflow '{}'",
                service.name, spec.name, spec.node_id, service.workflow
            ))
        })?;
        node.inputs.insert(spec.input.clone(), value.clone());
    }

    Ok(graph)
}

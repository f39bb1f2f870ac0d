//! End-node resolution.
//!
//! Many workflows contain several nodes that emit an `executed` event
//! (a local save plus a cloud upload, for instance), so the first one
//! seen is not proof the run is over. [`resolve_end_node`] picks the one
//! node whose completion is treated as authoritative.

use crate::service::OutputSpec;
use crate::workflow::WorkflowGraph;

/// Canonical engine node type that writes images to disk.
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// Prefix shared by save-style nodes from extensions (`SaveVideo`, `SaveImageS3`, ...).
pub const SAVE_CLASS_PREFIX: &str = "Save";

/// Which rule selected the end node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndNodeRule {
    /// The last declared service output.
    DeclaredOutput,
    /// The first node of type [`SAVE_IMAGE_CLASS`].
    SaveImage,
    /// The first node whose type starts with [`SAVE_CLASS_PREFIX`].
    SavePrefix,
    /// The last node of the graph. No semantic basis; callers should warn.
    LastNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndNode {
    pub node_id: String,
    pub rule: EndNodeRule,
}

/// Determine which node's `executed` event completes a run.
///
/// Rules, first match wins:
/// 1. the `node_id` of the last declared output;
/// 2. the first `SaveImage` node;
/// 3. the first node whose type starts with `Save`;
/// 4. the last node in natural key order.
///
/// Returns `None` only for an empty graph with no declared outputs.
pub fn resolve_end_node(graph: &WorkflowGraph, outputs: &[OutputSpec]) -> Option<EndNode> {
    if let Some(last) = outputs.last() {
        return Some(EndNode {
            node_id: last.source.node_id.clone(),
            rule: EndNodeRule::DeclaredOutput,
        });
    }

    let nodes = graph.nodes_in_order();

    if let Some((id, _)) = nodes.iter().find(|(_, n)| n.class_type == SAVE_IMAGE_CLASS) {
        return Some(EndNode {
            node_id: (*id).to_string(),
            rule: EndNodeRule::SaveImage,
        });
    }

    if let Some((id, _)) = nodes
        .iter()
        .find(|(_, n)| n.class_type.starts_with(SAVE_CLASS_PREFIX))
    {
        return Some(EndNode {
            node_id: (*id).to_string(),
            rule: EndNodeRule::SavePrefix,
        });
    }

    nodes.last().map(|(id, _)| EndNode {
        node_id: (*id).to_string(),
        rule: EndNodeRule::LastNode,
    })
}

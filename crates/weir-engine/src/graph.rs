//! The built, executable graph.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use weir_nodes::FlowNode;
use weir_schema::EdgeSpec;
use weir_types::NodeKind;

use crate::validation::Diagnostic;

/// Nodes are shared between the dispatcher and the per-node tasks; each
/// task locks its node for the duration of execution, input delivery locks
/// the target briefly.
pub type SharedNode = Arc<Mutex<Box<dyn FlowNode>>>;

/// Immutable edge record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub source_handle: String,
    pub target: String,
    pub target_handle: String,
}

impl From<&EdgeSpec> for Edge {
    fn from(spec: &EdgeSpec) -> Self {
        Self {
            id: spec.id.clone(),
            source: spec.source.clone(),
            source_handle: spec.source_handle.clone(),
            target: spec.target.clone(),
            target_handle: spec.target_handle.clone(),
        }
    }
}

/// A validated, normalized graph ready for execution.
pub struct FlowGraph {
    pub graph_type: String,
    pub debug: bool,
    pub debug_config: Option<Value>,
    pub nodes: HashMap<String, SharedNode>,
    /// Node kinds, readable without locking.
    pub kinds: HashMap<String, NodeKind>,
    pub edges: Vec<Edge>,
    /// Validation diagnostics; never fatal to construction.
    pub diagnostics: Vec<Diagnostic>,
    /// Id of the synthetic terminal inserted by the builder.
    pub terminal_id: String,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&SharedNode> {
        self.nodes.get(id)
    }

    pub fn kind(&self, id: &str) -> Option<NodeKind> {
        self.kinds.get(id).copied()
    }

    pub fn has_loop(&self) -> bool {
        self.kinds.values().any(|kind| *kind == NodeKind::Loop)
    }

    /// Id of the first loop node, if any.
    pub fn loop_id(&self) -> Option<&str> {
        self.kinds
            .iter()
            .find(|(_, kind)| **kind == NodeKind::Loop)
            .map(|(id, _)| id.as_str())
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }
}

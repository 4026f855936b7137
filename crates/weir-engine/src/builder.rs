//! Graph builder: validation, normalization, node construction, and
//! recursive sub-flow builds.
//!
//! Normalization inserts a single synthetic terminal node, rewrites any
//! edge targeting the reserved void handle to point at it, wires every end
//! node to it, drops exact duplicate edges, and seeds the caller's message
//! into the entry nodes. Validation diagnostics are attached to the graph,
//! never fatal.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use weir_nodes::{build_node, EndNode, FlowNode, SeedInput, SubFlow};
use weir_schema::GraphSpec;
use weir_types::{FlowEvent, NodeKind, Result, RunLog, HANDLE_VOID};

use crate::config::ExecutorConfig;
use crate::executor::execute_graph;
use crate::graph::{Edge, FlowGraph};
use crate::validation::{validate, Diagnostic, Severity};

/// Build an executable graph from a description plus the caller's request.
pub fn build(spec: GraphSpec, message: &str, images: Option<Vec<Value>>) -> Result<FlowGraph> {
    let mut diagnostics = validate(&spec);
    let debug = spec.debug;
    let terminal_id = format!("void_{}", uuid::Uuid::new_v4().simple());

    // Normalize edges: retarget void handles, drop exact duplicates.
    let mut seen = HashSet::new();
    let mut edges: Vec<Edge> = Vec::new();
    for edge_spec in &spec.edges {
        let mut edge = Edge::from(edge_spec);
        if edge.target_handle == HANDLE_VOID {
            edge.target = terminal_id.clone();
        }
        let signature = (
            edge.source.clone(),
            edge.target.clone(),
            edge.source_handle.clone(),
            edge.target_handle.clone(),
        );
        if seen.insert(signature) {
            edges.push(edge);
        }
    }

    // Every end node reports into the terminal.
    for node_spec in spec.nodes.iter().filter(|n| n.kind == NodeKind::End) {
        edges.push(Edge {
            id: uuid::Uuid::new_v4().simple().to_string(),
            source: node_spec.id.clone(),
            source_handle: weir_nodes::end::DEFAULT_OUTPUT_HANDLE.to_string(),
            target: terminal_id.clone(),
            target_handle: HANDLE_VOID.to_string(),
        });
    }

    // Construct node instances, seeding the request into entry nodes.
    let seed = SeedInput {
        message: message.to_string(),
        images,
    };
    let mut nodes = HashMap::new();
    let mut kinds = HashMap::new();
    for node_spec in &spec.nodes {
        let mut node = build_node(node_spec, &seed, debug)?;

        if node_spec.kind == NodeKind::Inner {
            match node
                .inner_flow_spec()
                .cloned()
                .ok_or_else(|| weir_types::WeirError::Configuration {
                    node: node_spec.id.clone(),
                    message: "inner node without a flow".into(),
                })
                .and_then(weir_schema::from_value)
            {
                Ok(inner_spec) => {
                    node.attach_sub_flow(Box::new(BuiltSubFlow::new(inner_spec)));
                }
                Err(err) => {
                    diagnostics.push(Diagnostic {
                        kind: "ConfigurationError".into(),
                        severity: Severity::Error,
                        message: format!(
                            "inner node '{}' has an invalid nested flow: {err}",
                            node_spec.id
                        ),
                        node_id: Some(node_spec.id.clone()),
                        edge: None,
                        context: json!({}),
                    });
                }
            }
        }

        kinds.insert(node_spec.id.clone(), node_spec.kind);
        nodes.insert(node_spec.id.clone(), Arc::new(Mutex::new(node)));
    }

    // The synthetic terminal.
    let terminal: Box<dyn FlowNode> = Box::new(EndNode::terminal(&terminal_id));
    nodes.insert(terminal_id.clone(), Arc::new(Mutex::new(terminal)));
    kinds.insert(terminal_id.clone(), NodeKind::Void);

    if !diagnostics.is_empty() {
        tracing::warn!(count = diagnostics.len(), "graph built with validation diagnostics");
    }

    Ok(FlowGraph {
        graph_type: spec.graph_type,
        debug,
        debug_config: spec.debug_config,
        nodes,
        kinds,
        edges,
        diagnostics,
        terminal_id,
    })
}

// ---------------------------------------------------------------------------
// BuiltSubFlow — nested graphs behind the SubFlow seam
// ---------------------------------------------------------------------------

/// A nested flow: rebuilt per run so the runtime message seeds its entry
/// nodes, then executed with the standard engine.
pub struct BuiltSubFlow {
    spec: GraphSpec,
    config: ExecutorConfig,
}

impl BuiltSubFlow {
    pub fn new(spec: GraphSpec) -> Self {
        Self {
            spec,
            config: ExecutorConfig::default(),
        }
    }
}

impl SubFlow for BuiltSubFlow {
    fn run<'a>(
        &'a mut self,
        message: String,
        run: &'a RunLog,
    ) -> Pin<Box<dyn Stream<Item = FlowEvent> + Send + 'a>> {
        let spec = self.spec.clone();
        let config = self.config.clone();
        let run = run.clone();
        Box::pin(async_stream::stream! {
            match build(spec, &message, None) {
                Ok(graph) => {
                    let mut inner = execute_graph(graph, run, config);
                    while let Some(event) = inner.next().await {
                        yield event;
                    }
                }
                Err(err) => {
                    yield FlowEvent::Debug {
                        content: json!({
                            "error_type": "ConfigurationError",
                            "error_message": format!("failed to build inner flow: {err}"),
                        }),
                        event_type: None,
                    };
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(json: serde_json::Value) -> GraphSpec {
        weir_schema::from_value(json).unwrap()
    }

    #[test]
    fn inserts_terminal_and_rewrites_void_edges() {
        let graph = build(
            spec(json!({
                "nodes": [
                    {"id": "u", "type": "user_input"},
                    {"id": "e", "type": "end"}
                ],
                "edges": [
                    // No targetHandle: defaults to the void handle.
                    {"source": "u", "target": "e", "sourceHandle": "handle_user_message"}
                ]
            })),
            "hello",
            None,
        )
        .unwrap();

        assert_eq!(graph.kind(&graph.terminal_id), Some(NodeKind::Void));
        // The void-handle edge was retargeted to the terminal.
        let retargeted = graph
            .edges
            .iter()
            .find(|edge| edge.source == "u")
            .unwrap();
        assert_eq!(retargeted.target, graph.terminal_id);
        // The end node received a synthetic edge into the terminal.
        assert!(graph
            .edges
            .iter()
            .any(|edge| edge.source == "e" && edge.target == graph.terminal_id));
    }

    #[test]
    fn message_seeds_user_input() {
        let graph = build(
            spec(json!({
                "nodes": [{"id": "u", "type": "user_input", "data": {"text": "old"}}],
                "edges": []
            })),
            "fresh message",
            None,
        )
        .unwrap();

        let node = graph.node("u").unwrap();
        let guard = node.blocking_lock();
        // The node text comes from the request, checked via internal state.
        assert_eq!(guard.internal_state()["text"], "fresh message");
    }

    #[test]
    fn duplicate_edges_are_dropped() {
        let graph = build(
            spec(json!({
                "nodes": [
                    {"id": "u", "type": "user_input"},
                    {"id": "e", "type": "end"}
                ],
                "edges": [
                    {"source": "u", "target": "e", "sourceHandle": "a", "targetHandle": "in"},
                    {"source": "u", "target": "e", "sourceHandle": "a", "targetHandle": "in"},
                    {"source": "u", "target": "e", "sourceHandle": "b", "targetHandle": "in"}
                ]
            })),
            "m",
            None,
        )
        .unwrap();

        let from_u = graph.edges.iter().filter(|e| e.source == "u").count();
        assert_eq!(from_u, 2, "exact duplicate dropped, handle variant kept");
        assert!(graph
            .diagnostics
            .iter()
            .any(|d| d.kind == "DuplicateEdge"));
    }

    #[test]
    fn validation_diagnostics_do_not_abort_build() {
        let graph = build(
            spec(json!({
                "nodes": [{"id": "e", "type": "end"}],
                "edges": []
            })),
            "m",
            None,
        )
        .unwrap();
        assert!(graph
            .diagnostics
            .iter()
            .any(|d| d.kind == "GraphValidationError"));
        assert!(graph.nodes.contains_key("e"));
    }

    #[test]
    fn inner_nodes_get_a_sub_flow() {
        let graph = build(
            spec(json!({
                "nodes": [
                    {"id": "u", "type": "user_input"},
                    {"id": "i", "type": "inner", "data": {"flow": {
                        "nodes": [
                            {"id": "iu", "type": "user_input"},
                            {"id": "ie", "type": "end"}
                        ],
                        "edges": [
                            {"source": "iu", "target": "ie", "sourceHandle": "handle_user_message", "targetHandle": "in"}
                        ]
                    }}}
                ],
                "edges": [
                    {"source": "u", "target": "i", "sourceHandle": "handle_user_message", "targetHandle": "handle_user_message"}
                ]
            })),
            "m",
            None,
        )
        .unwrap();
        // No configuration diagnostics means the sub-flow attached cleanly.
        assert!(!graph
            .diagnostics
            .iter()
            .any(|d| d.kind == "ConfigurationError"));
    }

    #[test]
    fn invalid_inner_flow_is_diagnosed() {
        let graph = build(
            spec(json!({
                "nodes": [
                    {"id": "u", "type": "user_input"},
                    {"id": "i", "type": "inner", "data": {"flow": {"nodes": "not a list"}}}
                ],
                "edges": []
            })),
            "m",
            None,
        )
        .unwrap();
        assert!(graph
            .diagnostics
            .iter()
            .any(|d| d.kind == "ConfigurationError"));
    }
}

//! Graph validation: rule objects and diagnostics.
//!
//! Rules run against the raw graph description before the builder
//! normalizes it. Diagnostics are attached to the built graph and surfaced
//! as debug events when execution starts; they never abort construction.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use weir_schema::{node_data, ConditionalData, GraphSpec};
use weir_types::NodeKind;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Error-taxonomy kind, e.g. `GraphValidationError`.
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub context: Value,
}

impl Diagnostic {
    /// The record emitted on the debug stream for this diagnostic.
    pub fn to_record(&self) -> Value {
        json!({
            "error_type": self.kind,
            "severity": match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            },
            "error_message": self.message,
            "node_id": self.node_id,
            "edge": self.edge.as_ref().map(|(s, t)| json!({"source": s, "target": t})),
            "context": self.context,
        })
    }
}

// ---------------------------------------------------------------------------
// Rule trait
// ---------------------------------------------------------------------------

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Exactly one user-input node.
struct SingleUserInputRule;
impl ValidationRule for SingleUserInputRule {
    fn name(&self) -> &str {
        "single_user_input"
    }

    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let entries: Vec<&str> = spec
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::UserInput)
            .map(|n| n.id.as_str())
            .collect();
        if entries.len() == 1 {
            return Vec::new();
        }
        vec![Diagnostic {
            kind: "GraphValidationError".into(),
            severity: Severity::Error,
            message: format!(
                "graph must contain exactly one user_input node, found {}",
                entries.len()
            ),
            node_id: None,
            edge: None,
            context: json!({"user_input_nodes": entries}),
        }]
    }
}

/// No two edges may share the full (source, target, source_handle,
/// target_handle) tuple. Edges differing only in handles are distinct
/// connections, not duplicates.
struct DuplicateEdgeRule;
impl ValidationRule for DuplicateEdgeRule {
    fn name(&self) -> &str {
        "duplicate_edge"
    }

    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags = Vec::new();
        for edge in &spec.edges {
            if !seen.insert(edge.signature()) {
                diags.push(Diagnostic {
                    kind: "DuplicateEdge".into(),
                    severity: Severity::Warning,
                    message: format!(
                        "duplicate edge {}.{} -> {}.{}",
                        edge.source, edge.source_handle, edge.target, edge.target_handle
                    ),
                    node_id: None,
                    edge: Some((edge.source.clone(), edge.target.clone())),
                    context: json!({"edge_id": edge.id}),
                });
            }
        }
        diags
    }
}

/// Edge endpoints must exist; self-loops warn.
struct EdgeEndpointsRule;
impl ValidationRule for EdgeEndpointsRule {
    fn name(&self) -> &str {
        "edge_endpoints"
    }

    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = spec.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut diags = Vec::new();
        for edge in &spec.edges {
            if !ids.contains(edge.source.as_str()) {
                diags.push(Diagnostic {
                    kind: "InvalidEdgeSource".into(),
                    severity: Severity::Error,
                    message: format!("edge references non-existent source node '{}'", edge.source),
                    node_id: None,
                    edge: Some((edge.source.clone(), edge.target.clone())),
                    context: json!({"edge_id": edge.id}),
                });
            }
            if !ids.contains(edge.target.as_str()) {
                diags.push(Diagnostic {
                    kind: "InvalidEdgeTarget".into(),
                    severity: Severity::Error,
                    message: format!("edge references non-existent target node '{}'", edge.target),
                    node_id: None,
                    edge: Some((edge.source.clone(), edge.target.clone())),
                    context: json!({"edge_id": edge.id}),
                });
            }
            if edge.source == edge.target {
                diags.push(Diagnostic {
                    kind: "SelfLoopEdge".into(),
                    severity: Severity::Warning,
                    message: format!("edge creates a self-loop on node '{}'", edge.source),
                    node_id: Some(edge.source.clone()),
                    edge: None,
                    context: json!({"edge_id": edge.id}),
                });
            }
        }
        diags
    }
}

/// Conditional nodes: declared outputs need edges, the default handle needs
/// an edge, undeclared outputs warn, and the condition template must parse.
struct ConditionalEdgesRule;
impl ValidationRule for ConditionalEdgesRule {
    fn name(&self) -> &str {
        "conditional_edges"
    }

    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        // Outgoing edge handles per node.
        let mut handles_by_source: HashMap<&str, HashSet<&str>> = HashMap::new();
        for edge in &spec.edges {
            handles_by_source
                .entry(edge.source.as_str())
                .or_default()
                .insert(edge.source_handle.as_str());
        }

        for node in spec.nodes.iter().filter(|n| n.kind == NodeKind::Conditional) {
            let data: ConditionalData = match node_data(&node.data) {
                Ok(data) => data,
                Err(err) => {
                    diags.push(Diagnostic {
                        kind: "ConfigurationError".into(),
                        severity: Severity::Error,
                        message: format!("conditional '{}' has invalid data: {err}", node.id),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        context: json!({}),
                    });
                    continue;
                }
            };

            for problem in data.check() {
                diags.push(Diagnostic {
                    kind: if problem.contains("template syntax") {
                        "TemplateSyntaxError".into()
                    } else {
                        "ConfigurationError".into()
                    },
                    severity: Severity::Error,
                    message: format!("conditional '{}': {problem}", node.id),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    context: json!({"condition": data.condition}),
                });
            }

            let edge_handles = handles_by_source
                .get(node.id.as_str())
                .cloned()
                .unwrap_or_default();

            match &data.output_handles {
                Some(declared) => {
                    let missing: Vec<&String> = declared
                        .iter()
                        .filter(|h| !edge_handles.contains(h.as_str()))
                        .collect();
                    if !missing.is_empty() {
                        diags.push(Diagnostic {
                            kind: "MissingConditionalEdge".into(),
                            severity: Severity::Error,
                            message: format!(
                                "conditional '{}' declares outputs {:?} but has no edges for {:?}",
                                node.id, declared, missing
                            ),
                            node_id: Some(node.id.clone()),
                            edge: None,
                            context: json!({
                                "declared_handles": declared,
                                "actual_handles": edge_handles.iter().collect::<Vec<_>>(),
                                "missing_handles": missing,
                            }),
                        });
                    }
                }
                None if !edge_handles.is_empty() => {
                    diags.push(Diagnostic {
                        kind: "UndeclaredOutputs".into(),
                        severity: Severity::Warning,
                        message: format!(
                            "conditional '{}' has edges with handles {:?} but no output_handles declared; routing errors surface at runtime only",
                            node.id,
                            edge_handles.iter().collect::<Vec<_>>()
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        context: json!({
                            "actual_handles": edge_handles.iter().collect::<Vec<_>>(),
                        }),
                    });
                }
                None => {}
            }

            if let Some(default) = &data.default_handle {
                if !edge_handles.contains(default.as_str()) {
                    diags.push(Diagnostic {
                        kind: "MissingDefaultEdge".into(),
                        severity: Severity::Error,
                        message: format!(
                            "conditional '{}' specifies default_handle '{default}' but no edge matches it",
                            node.id
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        context: json!({
                            "default_handle": default,
                            "actual_handles": edge_handles.iter().collect::<Vec<_>>(),
                        }),
                    });
                }
            }
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in rules. Pure in the graph description: applying it twice
/// yields the same list.
pub fn validate(spec: &GraphSpec) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn ValidationRule>> = vec![
        Box::new(SingleUserInputRule),
        Box::new(DuplicateEdgeRule),
        Box::new(EdgeEndpointsRule),
        Box::new(ConditionalEdgesRule),
    ];
    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(spec));
    }
    diagnostics
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

    fn errors(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
        diags.iter().filter(|d| d.severity == Severity::Error).collect()
    }

    #[test]
    fn valid_graph_passes() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "u", "target": "e", "sourceHandle": "handle_user_message", "targetHandle": "in"}
            ]
        }));
        assert!(errors(&validate(&spec)).is_empty());
    }

    #[test]
    fn zero_user_inputs_is_error() {
        let spec = spec(json!({
            "nodes": [{"id": "e", "type": "end"}],
            "edges": []
        }));
        let diags = validate(&spec);
        assert!(diags
            .iter()
            .any(|d| d.kind == "GraphValidationError" && d.severity == Severity::Error));
    }

    #[test]
    fn two_user_inputs_is_error() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u1", "type": "user_input"},
                {"id": "u2", "type": "user_input"}
            ],
            "edges": []
        }));
        let diags = validate(&spec);
        let diag = diags
            .iter()
            .find(|d| d.kind == "GraphValidationError")
            .unwrap();
        assert!(diag.message.contains("found 2"));
    }

    #[test]
    fn duplicate_edges_warn_but_different_handles_do_not() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "u", "target": "e", "sourceHandle": "a", "targetHandle": "in"},
                {"source": "u", "target": "e", "sourceHandle": "a", "targetHandle": "in"},
                {"source": "u", "target": "e", "sourceHandle": "b", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        let dups: Vec<_> = diags.iter().filter(|d| d.kind == "DuplicateEdge").collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].severity, Severity::Warning);
    }

    #[test]
    fn missing_endpoints_are_errors() {
        let spec = spec(json!({
            "nodes": [{"id": "u", "type": "user_input"}],
            "edges": [
                {"source": "ghost", "target": "u", "sourceHandle": "x", "targetHandle": "in"},
                {"source": "u", "target": "phantom", "sourceHandle": "x", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        assert!(diags.iter().any(|d| d.kind == "InvalidEdgeSource"));
        assert!(diags.iter().any(|d| d.kind == "InvalidEdgeTarget"));
    }

    #[test]
    fn self_loop_is_a_warning() {
        let spec = spec(json!({
            "nodes": [{"id": "u", "type": "user_input"}],
            "edges": [
                {"source": "u", "target": "u", "sourceHandle": "x", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        let diag = diags.iter().find(|d| d.kind == "SelfLoopEdge").unwrap();
        assert_eq!(diag.severity, Severity::Warning);
    }

    #[test]
    fn conditional_missing_declared_edge_is_error() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "c", "type": "conditional",
                 "data": {"condition": "{{ 'yes' }}", "output_handles": ["yes", "no"]}},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "u", "target": "c", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
                {"source": "c", "target": "e", "sourceHandle": "yes", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        let diag = diags
            .iter()
            .find(|d| d.kind == "MissingConditionalEdge")
            .unwrap();
        assert!(diag.message.contains("no"));
        assert_eq!(diag.severity, Severity::Error);
    }

    #[test]
    fn conditional_without_declaration_warns() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "c", "type": "conditional", "data": {"condition": "{{ 'yes' }}"}},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "u", "target": "c", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
                {"source": "c", "target": "e", "sourceHandle": "yes", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        let diag = diags.iter().find(|d| d.kind == "UndeclaredOutputs").unwrap();
        assert_eq!(diag.severity, Severity::Warning);
        assert!(diag.message.contains("yes"));
    }

    #[test]
    fn conditional_missing_default_edge_is_error() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "c", "type": "conditional",
                 "data": {"condition": "{{ 'yes' }}", "output_handles": ["yes"], "default_handle": "yes"}},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "u", "target": "c", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
                {"source": "c", "target": "e", "sourceHandle": "other", "targetHandle": "in"}
            ]
        }));
        let diags = validate(&spec);
        assert!(diags.iter().any(|d| d.kind == "MissingConditionalEdge"));
        assert!(diags.iter().any(|d| d.kind == "MissingDefaultEdge"));
    }

    #[test]
    fn invalid_condition_template_is_error() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u", "type": "user_input"},
                {"id": "c", "type": "conditional", "data": {"condition": "{{ broken"}}
            ],
            "edges": []
        }));
        let diags = validate(&spec);
        assert!(diags
            .iter()
            .any(|d| d.kind == "TemplateSyntaxError" && d.severity == Severity::Error));
    }

    #[test]
    fn validator_is_idempotent() {
        let spec = spec(json!({
            "nodes": [
                {"id": "u1", "type": "user_input"},
                {"id": "u2", "type": "user_input"}
            ],
            "edges": [
                {"source": "u1", "target": "u2", "sourceHandle": "a", "targetHandle": "in"},
                {"source": "u1", "target": "u2", "sourceHandle": "a", "targetHandle": "in"}
            ]
        }));
        let first: Vec<String> = validate(&spec).iter().map(|d| d.kind.clone()).collect();
        let second: Vec<String> = validate(&spec).iter().map(|d| d.kind.clone()).collect();
        assert_eq!(first, second);
    }
}

//! Event collection and aggregation into the execution summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::events::{DebugEvent, DebugEventKind};

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExecutionSummary {
    pub node_id: String,
    pub node_kind: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub internal_state: Map<String, Value>,
    pub was_executed: bool,
    pub was_bypassed: bool,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub event_count: usize,
}

impl NodeExecutionSummary {
    fn new(node_id: &str, node_kind: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_kind: node_kind.to_string(),
            ..Self::default()
        }
    }

    /// Flat dictionary form kept for older consumers.
    pub fn to_legacy(&self) -> Value {
        serde_json::json!({
            "node_id": self.node_id,
            "node_type": self.node_kind,
            "start_time": self.start_time.map(|t| t.to_rfc3339()),
            "end_time": self.end_time.map(|t| t.to_rfc3339()),
            "execution_duration_ms": self.duration_ms,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "internal_variables": self.internal_state,
            "was_executed": self.was_executed,
            "was_bypassed": self.was_bypassed,
            "error": self.error,
            "error_type": self.error_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTrace {
    pub source: String,
    pub source_handle: String,
    pub target: String,
    pub target_handle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphExecutionSummary {
    pub execution_id: String,
    pub graph_type: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<f64>,
    pub nodes: BTreeMap<String, NodeExecutionSummary>,
    pub total_nodes: usize,
    pub executed_nodes: usize,
    pub bypassed_nodes: usize,
    pub failed_nodes: usize,
    pub edges_processed: Vec<EdgeTrace>,
    pub all_events: Vec<DebugEvent>,
}

impl GraphExecutionSummary {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Flat dictionary form: node summaries as a list, counts at the top.
    pub fn to_legacy(&self) -> Value {
        serde_json::json!({
            "execution_id": self.execution_id,
            "graph_type": self.graph_type,
            "start_time": self.start_time.map(|t| t.to_rfc3339()),
            "end_time": self.end_time.map(|t| t.to_rfc3339()),
            "total_duration_ms": self.total_duration_ms,
            "nodes": self.nodes.values().map(|n| n.to_legacy()).collect::<Vec<_>>(),
            "total_nodes": self.total_nodes,
            "executed_nodes": self.executed_nodes,
            "bypassed_nodes": self.bypassed_nodes,
            "failed_nodes": self.failed_nodes,
            "edges_processed": self.edges_processed,
        })
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Aggregates events into node and graph summaries as they pass the
/// pipeline.
pub struct Collector {
    execution_id: String,
    graph_type: String,
    total_nodes: usize,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    nodes: BTreeMap<String, NodeExecutionSummary>,
    edges: Vec<EdgeTrace>,
    events: Vec<DebugEvent>,
}

impl Collector {
    pub fn new(execution_id: &str, graph_type: &str, total_nodes: usize) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            graph_type: graph_type.to_string(),
            total_nodes,
            start_time: None,
            end_time: None,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            events: Vec::new(),
        }
    }

    fn node_entry(&mut self, event: &DebugEvent) -> Option<&mut NodeExecutionSummary> {
        let node_id = event.node_id.clone()?;
        let node_kind = event.node_kind.clone().unwrap_or_default();
        Some(
            self.nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeExecutionSummary::new(&node_id, &node_kind)),
        )
    }

    pub fn collect(&mut self, event: &DebugEvent) {
        self.events.push(event.clone());

        match event.kind {
            DebugEventKind::GraphStart => {
                self.start_time = Some(event.timestamp);
                if let Some(total) = event.payload.get("total_nodes").and_then(|v| v.as_u64()) {
                    self.total_nodes = total as usize;
                }
            }
            DebugEventKind::GraphEnd => {
                self.end_time = Some(event.timestamp);
            }
            DebugEventKind::NodeStart => {
                let timestamp = event.timestamp;
                let inputs = event.payload.get("inputs").cloned();
                if let Some(node) = self.node_entry(event) {
                    node.start_time = Some(timestamp);
                    if let Some(Value::Object(map)) = inputs {
                        node.inputs = map;
                    }
                    node.event_count += 1;
                }
            }
            DebugEventKind::NodeEnd => {
                let timestamp = event.timestamp;
                let outputs = event.payload.get("outputs").cloned();
                let internal = event.payload.get("internal_state").cloned();
                let duration = event.payload.get("duration_ms").and_then(|v| v.as_f64());
                if let Some(node) = self.node_entry(event) {
                    node.end_time = Some(timestamp);
                    node.duration_ms = duration;
                    node.was_executed = true;
                    if let Some(Value::Object(map)) = outputs {
                        node.outputs = map;
                    }
                    if let Some(Value::Object(map)) = internal {
                        node.internal_state = map;
                    }
                    node.event_count += 1;
                }
            }
            DebugEventKind::NodeBypass => {
                if let Some(node) = self.node_entry(event) {
                    node.was_bypassed = true;
                    node.event_count += 1;
                }
            }
            kind if kind.is_error() => {
                let error_type = event
                    .payload
                    .get("error_type")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let message = event
                    .payload
                    .get("error_message")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                if let Some(node) = self.node_entry(event) {
                    node.error_type = error_type;
                    node.error = message;
                    node.event_count += 1;
                }
            }
            DebugEventKind::EdgeTraversed => {
                let get = |key: &str| {
                    event
                        .payload
                        .get(key)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                self.edges.push(EdgeTrace {
                    source: get("source"),
                    source_handle: get("source_handle"),
                    target: get("target"),
                    target_handle: get("target_handle"),
                });
            }
            _ => {
                if let Some(node) = self.node_entry(event) {
                    node.event_count += 1;
                }
            }
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// (total, executed, bypassed, failed, start_time) as currently known.
    pub fn snapshot_counts(&self) -> (usize, usize, usize, usize, Option<DateTime<Utc>>) {
        let executed = self.nodes.values().filter(|n| n.was_executed).count();
        let bypassed = self.nodes.values().filter(|n| n.was_bypassed).count();
        let failed = self.nodes.values().filter(|n| n.error_type.is_some()).count();
        let total = if self.total_nodes > 0 {
            self.total_nodes
        } else {
            self.nodes.len()
        };
        (total, executed, bypassed, failed, self.start_time)
    }

    /// Build the final summary. Counts are derived from the node entries.
    pub fn finalize(mut self) -> GraphExecutionSummary {
        let end_time = self.end_time.unwrap_or_else(Utc::now);
        let total_duration_ms = self
            .start_time
            .map(|start| (end_time - start).num_microseconds().unwrap_or(0) as f64 / 1000.0);

        let executed = self.nodes.values().filter(|n| n.was_executed).count();
        let bypassed = self.nodes.values().filter(|n| n.was_bypassed).count();
        let failed = self.nodes.values().filter(|n| n.error_type.is_some()).count();

        if self.total_nodes == 0 {
            self.total_nodes = self.nodes.len();
        }

        GraphExecutionSummary {
            execution_id: self.execution_id,
            graph_type: self.graph_type,
            start_time: self.start_time,
            end_time: Some(end_time),
            total_duration_ms,
            nodes: self.nodes,
            total_nodes: self.total_nodes,
            executed_nodes: executed,
            bypassed_nodes: bypassed,
            failed_nodes: failed,
            edges_processed: self.edges,
            all_events: self.events,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The unified debug event model.
//!
//! Every debug record in the system is a [`DebugEvent`]. Events serialize in
//! two shapes: the structured form (a faithful round-trippable record) and a
//! legacy flat dictionary kept for older stream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Kinds and severities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugEventKind {
    // Lifecycle
    NodeInit,
    NodeStart,
    NodeEnd,
    NodeError,
    NodeBypass,
    GraphStart,
    GraphEnd,
    IterationStart,
    IterationEnd,
    // Data flow
    InputReceived,
    OutputProduced,
    EdgeTraversed,
    DataTransformed,
    // State
    StateChange,
    // Errors
    ValidationError,
    RoutingError,
    TimeoutError,
    InputError,
    TemplateError,
    ParseError,
    // Diagnostics
    ConditionEvaluated,
    TemplateRendered,
    LlmGeneration,
    TimingCheckpoint,
}

impl DebugEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugEventKind::NodeInit => "node_init",
            DebugEventKind::NodeStart => "node_start",
            DebugEventKind::NodeEnd => "node_end",
            DebugEventKind::NodeError => "node_error",
            DebugEventKind::NodeBypass => "node_bypass",
            DebugEventKind::GraphStart => "graph_start",
            DebugEventKind::GraphEnd => "graph_end",
            DebugEventKind::IterationStart => "iteration_start",
            DebugEventKind::IterationEnd => "iteration_end",
            DebugEventKind::InputReceived => "input_received",
            DebugEventKind::OutputProduced => "output_produced",
            DebugEventKind::EdgeTraversed => "edge_traversed",
            DebugEventKind::DataTransformed => "data_transformed",
            DebugEventKind::StateChange => "state_change",
            DebugEventKind::ValidationError => "validation_error",
            DebugEventKind::RoutingError => "routing_error",
            DebugEventKind::TimeoutError => "timeout_error",
            DebugEventKind::InputError => "input_error",
            DebugEventKind::TemplateError => "template_error",
            DebugEventKind::ParseError => "parse_error",
            DebugEventKind::ConditionEvaluated => "condition_evaluated",
            DebugEventKind::TemplateRendered => "template_rendered",
            DebugEventKind::LlmGeneration => "llm_generation",
            DebugEventKind::TimingCheckpoint => "timing_checkpoint",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DebugEventKind::NodeError
                | DebugEventKind::ValidationError
                | DebugEventKind::RoutingError
                | DebugEventKind::TimeoutError
                | DebugEventKind::InputError
                | DebugEventKind::TemplateError
                | DebugEventKind::ParseError
        )
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            DebugEventKind::NodeInit
                | DebugEventKind::NodeStart
                | DebugEventKind::NodeEnd
                | DebugEventKind::NodeError
                | DebugEventKind::NodeBypass
                | DebugEventKind::GraphStart
                | DebugEventKind::GraphEnd
                | DebugEventKind::IterationStart
                | DebugEventKind::IterationEnd
        )
    }

    pub fn is_data_flow(&self) -> bool {
        matches!(
            self,
            DebugEventKind::InputReceived
                | DebugEventKind::OutputProduced
                | DebugEventKind::EdgeTraversed
                | DebugEventKind::DataTransformed
        )
    }

    /// Map an `error_type` string from the error taxonomy onto an event kind.
    pub fn for_error(error_type: &str) -> Self {
        match error_type {
            "GraphValidationError" | "ValidationError" | "MissingConditionalEdge"
            | "MissingDefaultEdge" | "InvalidEdgeSource" | "InvalidEdgeTarget" => {
                DebugEventKind::ValidationError
            }
            "GraphRoutingError" | "ConfigurationError" => DebugEventKind::RoutingError,
            "TimeoutError" => DebugEventKind::TimeoutError,
            "InputError" => DebugEventKind::InputError,
            "TemplateError" | "TemplateSyntaxError" | "TemplateEvaluationError" => {
                DebugEventKind::TemplateError
            }
            "JSONParseError" => DebugEventKind::ParseError,
            _ => DebugEventKind::NodeError,
        }
    }
}

/// Severity ladder; ordering matters for the minimum-severity filter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DebugSeverity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl DebugSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugSeverity::Trace => "trace",
            DebugSeverity::Debug => "debug",
            DebugSeverity::Info => "info",
            DebugSeverity::Warn => "warn",
            DebugSeverity::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// DebugEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub event_id: String,
    #[serde(rename = "event_type")]
    pub kind: DebugEventKind,
    pub severity: DebugSeverity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_kind: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_event_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl DebugEvent {
    pub fn new(kind: DebugEventKind) -> Self {
        let severity = if kind.is_error() {
            DebugSeverity::Error
        } else {
            DebugSeverity::Info
        };
        Self {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            severity,
            timestamp: Utc::now(),
            execution_id: String::new(),
            sequence_number: 0,
            node_id: None,
            node_kind: None,
            payload: Map::new(),
            parent_event_id: None,
            related_event_ids: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_node(mut self, node_id: &str, node_kind: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self.node_kind = Some(node_kind.to_string());
        self
    }

    pub fn with_severity(mut self, severity: DebugSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }

    /// Structured serialization.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild an event from its structured serialization.
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Legacy flat-dictionary form kept for older stream consumers: the
    /// payload is lifted to the top level next to the node identifiers.
    pub fn to_legacy(&self) -> Value {
        let mut flat = Map::new();
        if let Some(node_id) = &self.node_id {
            flat.insert("node_id".into(), Value::String(node_id.clone()));
        }
        if let Some(node_kind) = &self.node_kind {
            flat.insert("node_type".into(), Value::String(node_kind.clone()));
        }
        for (key, value) in &self.payload {
            flat.insert(key.clone(), value.clone());
        }
        match self.kind {
            DebugEventKind::NodeEnd => {
                flat.insert("was_executed".into(), Value::Bool(true));
                flat.insert("was_bypassed".into(), Value::Bool(false));
            }
            DebugEventKind::NodeBypass => {
                flat.insert("was_executed".into(), Value::Bool(false));
                flat.insert("was_bypassed".into(), Value::Bool(true));
            }
            kind if kind.is_error() => {
                flat.insert(
                    "timestamp".into(),
                    Value::String(self.timestamp.to_rfc3339()),
                );
            }
            _ => {}
        }
        Value::Object(flat)
    }
}

// ---------------------------------------------------------------------------
// Factory helpers for the common event shapes
// ---------------------------------------------------------------------------

pub fn node_start_event(node_id: &str, node_kind: &str, inputs: Value) -> DebugEvent {
    DebugEvent::new(DebugEventKind::NodeStart)
        .with_node(node_id, node_kind)
        .with_payload("inputs", inputs)
        .with_payload("start_time", Value::String(Utc::now().to_rfc3339()))
}

pub fn node_end_event(
    node_id: &str,
    node_kind: &str,
    outputs: Value,
    internal_state: Value,
    duration_ms: f64,
) -> DebugEvent {
    DebugEvent::new(DebugEventKind::NodeEnd)
        .with_node(node_id, node_kind)
        .with_payload("outputs", outputs)
        .with_payload("internal_state", internal_state)
        .with_payload("duration_ms", serde_json::json!(duration_ms))
        .with_payload("end_time", Value::String(Utc::now().to_rfc3339()))
}

pub fn node_error_event(
    node_id: &str,
    node_kind: &str,
    error_type: &str,
    error_message: &str,
    context: Value,
) -> DebugEvent {
    DebugEvent::new(DebugEventKind::for_error(error_type))
        .with_node(node_id, node_kind)
        .with_severity(DebugSeverity::Error)
        .with_payload("error_type", Value::String(error_type.to_string()))
        .with_payload("error_message", Value::String(error_message.to_string()))
        .with_payload("context", context)
}

pub fn node_bypass_event(node_id: &str, node_kind: &str, reason: &str) -> DebugEvent {
    DebugEvent::new(DebugEventKind::NodeBypass)
        .with_node(node_id, node_kind)
        .with_payload("reason", Value::String(reason.to_string()))
}

pub fn graph_start_event(graph_type: &str, total_nodes: usize) -> DebugEvent {
    DebugEvent::new(DebugEventKind::GraphStart)
        .with_payload("graph_type", Value::String(graph_type.to_string()))
        .with_payload("total_nodes", serde_json::json!(total_nodes))
        .with_payload("start_time", Value::String(Utc::now().to_rfc3339()))
}

pub fn graph_end_event(
    total_nodes: usize,
    executed: usize,
    bypassed: usize,
    failed: usize,
    total_duration_ms: f64,
) -> DebugEvent {
    DebugEvent::new(DebugEventKind::GraphEnd)
        .with_payload("total_nodes", serde_json::json!(total_nodes))
        .with_payload("executed_nodes", serde_json::json!(executed))
        .with_payload("bypassed_nodes", serde_json::json!(bypassed))
        .with_payload("failed_nodes", serde_json::json!(failed))
        .with_payload("total_duration_ms", serde_json::json!(total_duration_ms))
        .with_payload("end_time", Value::String(Utc::now().to_rfc3339()))
}

pub fn edge_traversed_event(
    source: &str,
    source_handle: &str,
    target: &str,
    target_handle: &str,
) -> DebugEvent {
    DebugEvent::new(DebugEventKind::EdgeTraversed)
        .with_severity(DebugSeverity::Debug)
        .with_payload("source", Value::String(source.to_string()))
        .with_payload("source_handle", Value::String(source_handle.to_string()))
        .with_payload("target", Value::String(target.to_string()))
        .with_payload("target_handle", Value::String(target_handle.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

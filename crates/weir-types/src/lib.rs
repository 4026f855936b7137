//! Shared types for the Weir flow engine.
//!
//! This crate provides the foundational types used across all other Weir
//! crates:
//! - `WeirError` — unified error taxonomy
//! - `NodeKind` — the node-kind tags of the graph dialect
//! - `Envelope` — the wrapper around values stored in node output handles
//! - `RunLog` — per-request identifiers threaded through node execution
//! - `FlowEvent` — the records yielded on the user-facing output stream
//! - reserved handle names and conditional system signals

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for all Weir subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WeirError {
    // === Graph structure ===
    #[error("Graph validation failed: {0}")]
    Validation(String),

    #[error("Conditional '{node}' selected handle '{handle}' but no outgoing edge matches")]
    Routing { node: String, handle: String },

    #[error("Node '{node}' is misconfigured: {message}")]
    Configuration { node: String, message: String },

    // === Runtime ===
    #[error("Node '{node}' timed out waiting for inputs after {seconds}s")]
    InputTimeout { node: String, seconds: u64 },

    #[error("Loop '{node}' exceeded max iterations ({limit})")]
    MaxIterationsExceeded { node: String, limit: usize },

    #[error("Node '{node}' did not receive required input '{handle}'")]
    MissingInput { node: String, handle: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Node '{node}' failed: {message}")]
    NodeFailure { node: String, message: String },

    // === LLM provider ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Authentication failed for provider {provider}")]
    Auth { provider: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WeirError {
    /// The `error_type` string carried by debug events for this error.
    pub fn error_kind(&self) -> &'static str {
        match self {
            WeirError::Validation(_) => "GraphValidationError",
            WeirError::Routing { .. } => "GraphRoutingError",
            WeirError::Configuration { .. } => "ConfigurationError",
            WeirError::InputTimeout { .. } => "TimeoutError",
            WeirError::MaxIterationsExceeded { .. } => "MaxIterationsExceeded",
            WeirError::MissingInput { .. } => "InputError",
            WeirError::Template(_) => "TemplateError",
            WeirError::NodeFailure { .. } => "NodeError",
            WeirError::Provider { .. } | WeirError::Auth { .. } | WeirError::Http(_) => {
                "ProviderError"
            }
            WeirError::Json(_) => "JSONParseError",
            WeirError::Io(_) => "IoError",
            WeirError::Other(_) => "UnexpectedError",
        }
    }

    /// Returns `true` when the error should stop draining the stream.
    ///
    /// Almost nothing does: node failures surface as debug events and the
    /// graph still completes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WeirError::Io(_))
    }
}

/// A convenience alias for `Result<T, WeirError>`.
pub type Result<T> = std::result::Result<T, WeirError>;

// ---------------------------------------------------------------------------
// Reserved handles and system signals
// ---------------------------------------------------------------------------

/// Target handle rewritten by the builder to point at the synthetic terminal.
pub const HANDLE_VOID: &str = "handle-void";

/// Event kind for chunks destined for the user stream.
pub const EVENT_CONTENT: &str = "content";
/// Event kind for single debug records.
pub const EVENT_DEBUG: &str = "debug";
/// Event kind for the final execution summary.
pub const EVENT_DEBUG_SUMMARY: &str = "debug_summary";

/// Conditional system signals. Never stored as output handles.
pub const SIGNAL_BYPASS_ALL: &str = "__bypass_all__";
pub const SIGNAL_DEFAULT: &str = "__default__";
pub const SIGNAL_ERROR: &str = "__error__";
pub const SIGNAL_TIMEOUT: &str = "__timeout__";

/// True for the reserved event kinds that must not be treated as handles.
pub fn is_system_event(kind: &str) -> bool {
    matches!(kind, EVENT_CONTENT | EVENT_DEBUG | EVENT_DEBUG_SUMMARY)
}

/// True for conditional system signals (`__name__` style).
pub fn is_system_signal(kind: &str) -> bool {
    kind.starts_with("__") && kind.ends_with("__")
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Node-kind tags of the graph dialect.
///
/// `Void` is reserved for the synthetic terminal inserted by the builder and
/// is not expected in user-authored graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    UserInput,
    Text,
    Parser,
    Fetch,
    Client,
    Llm,
    Chat,
    SendMessage,
    Conditional,
    Loop,
    Inner,
    End,
    Void,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::UserInput => "user_input",
            NodeKind::Text => "text",
            NodeKind::Parser => "parser",
            NodeKind::Fetch => "fetch",
            NodeKind::Client => "client",
            NodeKind::Llm => "llm",
            NodeKind::Chat => "chat",
            NodeKind::SendMessage => "send_message",
            NodeKind::Conditional => "conditional",
            NodeKind::Loop => "loop",
            NodeKind::Inner => "inner",
            NodeKind::End => "end",
            NodeKind::Void => "void",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope — wrapper for values stored in output handles
// ---------------------------------------------------------------------------

/// The record stored under a node's output handle: the producing node kind
/// plus the payload. Loop item outputs additionally carry the iteration
/// index and the payload's JSON type name; the payload keeps its original
/// type, it is never string-coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub producer: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl Envelope {
    pub fn new(producer: impl Into<String>, content: Value) -> Self {
        Self {
            producer: producer.into(),
            content,
            index: None,
            type_name: None,
        }
    }

    /// Envelope for a loop item: preserves the value and records its index
    /// and JSON type name.
    pub fn item(producer: impl Into<String>, content: Value, index: usize) -> Self {
        let type_name = json_type_name(&content).to_string();
        Self {
            producer: producer.into(),
            content,
            index: Some(index),
            type_name: Some(type_name),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Unwrap one envelope layer from a JSON value, if present.
///
/// Values delivered through `add_parent` are sometimes still wrapped in the
/// `{producer, content}` record; consumers that want the raw payload use
/// this to peel exactly one layer.
pub fn unwrap_envelope(value: &Value) -> &Value {
    match value {
        Value::Object(map) if map.contains_key("content") && map.contains_key("producer") => {
            &map["content"]
        }
        other => other,
    }
}

/// JSON type name of a value, as reported in loop item envelopes.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// RunLog — per-request identifiers
// ---------------------------------------------------------------------------

/// Identifiers for one graph invocation, threaded into every node call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    pub id_chat: Option<String>,
    pub id_thread: Option<String>,
    pub id_user: Option<String>,
    pub id_app: Option<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat(mut self, id: impl Into<String>) -> Self {
        self.id_chat = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// NodeEvent — items of a node's async event sequence
// ---------------------------------------------------------------------------

/// One item produced by a node's `call` stream.
///
/// The `kind` is either the reserved streaming-content kind, a debug kind, a
/// conditional system signal, or an output handle name (the dispatcher
/// stores `content` under `outputs[kind]`).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub kind: String,
    pub content: Value,
}

impl NodeEvent {
    /// An output-handle event carrying an envelope-wrapped value.
    pub fn output(handle: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            kind: handle.into(),
            content: envelope.to_value(),
        }
    }

    /// A streaming-content chunk for the user stream.
    pub fn content(chunk: Value) -> Self {
        Self {
            kind: EVENT_CONTENT.to_string(),
            content: chunk,
        }
    }

    /// A debug record passed through to the debug pipeline.
    pub fn debug(record: Value) -> Self {
        Self {
            kind: EVENT_DEBUG.to_string(),
            content: record,
        }
    }

    /// A conditional system signal (`__bypass_all__` and friends).
    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            kind: name.into(),
            content: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// LoopProgress
// ---------------------------------------------------------------------------

/// Progress record emitted once per loop iteration start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopProgress {
    pub loop_id: String,
    pub current: usize,
    pub total: usize,
    pub progress: f64,
    pub item_preview: String,
    pub elapsed_ms: f64,
    pub estimated_remaining_ms: f64,
}

impl LoopProgress {
    pub fn new(loop_id: &str, current: usize, total: usize, item: &Value, elapsed_ms: f64) -> Self {
        let progress = if total > 0 {
            ((current + 1) as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        let preview: String = preview_of(item, 100);
        Self {
            loop_id: loop_id.to_string(),
            current,
            total,
            progress,
            item_preview: preview,
            elapsed_ms: (elapsed_ms * 100.0).round() / 100.0,
            estimated_remaining_ms: estimate_remaining(current, total, elapsed_ms),
        }
    }
}

fn estimate_remaining(current: usize, total: usize, elapsed_ms: f64) -> f64 {
    if current == 0 {
        return 0.0;
    }
    let avg_per_item = elapsed_ms / (current + 1) as f64;
    let remaining_items = total.saturating_sub(current + 1);
    (avg_per_item * remaining_items as f64 * 100.0).round() / 100.0
}

/// Short textual preview of a JSON value, capped at `max` characters.
pub fn preview_of(value: &Value, max: usize) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    rendered.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// FlowEvent — the user-facing output stream record
// ---------------------------------------------------------------------------

/// One record on the executor's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Opaque streaming chunk from a node (e.g. an LLM delta).
    Content {
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_node: Option<String>,
    },
    /// A single debug event that passed the pipeline.
    Debug {
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    /// The complete execution summary, emitted exactly once before close.
    DebugSummary { content: Value },
    /// Per-iteration loop progress.
    LoopProgress { content: LoopProgress },
}

impl FlowEvent {
    pub fn content(chunk: Value, source_node: Option<String>) -> Self {
        FlowEvent::Content {
            content: chunk,
            source_node,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, FlowEvent::Content { .. })
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, FlowEvent::Debug { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

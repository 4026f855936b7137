//! The JSON graph dialect consumed by the Weir builder.
//!
//! A graph description is `{ type, debug, debug_config?, nodes: [...],
//! edges: [...] }`. Each node is `{ id, type, data? }`; each edge is
//! `{ id, source, target, sourceHandle, targetHandle? }`. The JSON is the
//! source of truth: unknown keys are preserved inside `data` and handle
//! names are overridable per node via `data.handles`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weir_types::{NodeKind, Result, WeirError, HANDLE_VOID};

// ---------------------------------------------------------------------------
// Graph description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(rename = "type", alias = "graph_type", default = "default_graph_type")]
    pub graph_type: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_config: Option<Value>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

fn default_graph_type() -> String {
    "chat".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default = "new_edge_id")]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "sourceHandle", alias = "source_handle", default)]
    pub source_handle: String,
    #[serde(
        rename = "targetHandle",
        alias = "target_handle",
        default = "default_target_handle"
    )]
    pub target_handle: String,
}

fn new_edge_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_target_handle() -> String {
    HANDLE_VOID.to_string()
}

impl EdgeSpec {
    pub fn new(source: &str, source_handle: &str, target: &str, target_handle: &str) -> Self {
        Self {
            id: new_edge_id(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: source_handle.to_string(),
            target_handle: target_handle.to_string(),
        }
    }

    /// The 4-tuple that identifies a duplicate edge.
    pub fn signature(&self) -> (&str, &str, &str, &str) {
        (
            &self.source,
            &self.target,
            &self.source_handle,
            &self.target_handle,
        )
    }
}

/// Parse a graph description from JSON text.
pub fn parse(input: &str) -> Result<GraphSpec> {
    Ok(serde_json::from_str(input)?)
}

/// Parse a graph description from an already-decoded JSON value.
pub fn from_value(value: Value) -> Result<GraphSpec> {
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Handle overrides
// ---------------------------------------------------------------------------

/// Per-node handle-name overrides from `data.handles`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handles(pub HashMap<String, String>);

impl Handles {
    /// Resolve a handle name: the first matching override key wins,
    /// otherwise the built-in default.
    pub fn resolve(&self, keys: &[&str], default: &str) -> String {
        for key in keys {
            if let Some(name) = self.0.get(*key) {
                return name.clone();
            }
        }
        default.to_string()
    }
}

// ---------------------------------------------------------------------------
// Per-kind node data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInputData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub files: Option<Vec<Value>>,
    #[serde(default)]
    pub images: Option<Vec<Value>>,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParserData {
    /// Jinja template rendered with the node's (JSON-decoded) inputs.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchData {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub json_data: Option<Value>,
    #[serde(default)]
    pub handles: Handles,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientData {
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub model: String,
    /// Provider connection details (api_key, base_url, ...); either an
    /// object or a JSON-encoded string.
    #[serde(default)]
    pub api_info: Option<Value>,
    #[serde(default)]
    pub extra_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmData {
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub json_output: bool,
    #[serde(default)]
    pub extra_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub handles: Handles,
}

fn default_true() -> bool {
    true
}

impl Default for LlmData {
    fn default() -> Self {
        Self {
            stream: true,
            json_output: false,
            extra_data: serde_json::Map::new(),
            handles: Handles::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatData {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub memory: Option<Value>,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub extras: Option<Value>,
    #[serde(default)]
    pub handles: Handles,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoopData {
    #[serde(default)]
    pub handles: Handles,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InnerData {
    /// The nested graph description, parsed recursively by the builder.
    #[serde(alias = "magic_flow")]
    pub flow: Value,
    #[serde(default)]
    pub handles: Handles,
}

// ---------------------------------------------------------------------------
// Conditional data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Flat,
    Namespaced,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionalData {
    /// Jinja template that renders to the name of the selected output handle.
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub handles: Handles,
    #[serde(default)]
    pub output_handles: Option<Vec<String>>,
    #[serde(default)]
    pub default_handle: Option<String>,
}

impl ConditionalData {
    /// Build-time checks: non-empty condition with valid template syntax,
    /// no reserved handle names, default handle consistent with the
    /// declared outputs. Returns one message per problem.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.condition.is_empty() {
            problems.push("conditional requires a non-empty 'condition' template".to_string());
        } else if let Err(err) = template_syntax_check(&self.condition) {
            problems.push(format!("invalid template syntax in condition: {err}"));
        }

        if let Some(handles) = &self.output_handles {
            for handle in handles {
                if handle.is_empty() {
                    problems.push("output handle name cannot be empty".to_string());
                } else if weir_types::is_system_signal(handle) {
                    problems.push(format!(
                        "output handle '{handle}' collides with a reserved system signal"
                    ));
                }
            }
        }

        if let Some(default) = &self.default_handle {
            if weir_types::is_system_signal(default) {
                problems.push(format!(
                    "default_handle '{default}' collides with a reserved system signal"
                ));
            }
            if let Some(handles) = &self.output_handles {
                if !handles.contains(default) {
                    problems.push(format!(
                        "default_handle '{default}' is not one of the declared output_handles"
                    ));
                }
            }
        }

        problems
    }
}

/// Parse a Jinja template without rendering it.
pub fn template_syntax_check(source: &str) -> Result<()> {
    let env = minijinja::Environment::new();
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|err| WeirError::Template(err.to_string()))
}

/// Decode a node's `data` into a typed struct, tolerating absent data.
pub fn node_data<T: Default + for<'de> Deserialize<'de>>(data: &Value) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(data.clone())?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

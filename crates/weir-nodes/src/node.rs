//! The `FlowNode` trait and the shared per-node state core.

use std::collections::HashMap;
use std::pin::Pin;

use futures_core::Stream;
use serde_json::{json, Map, Value};

use weir_types::{Envelope, NodeEvent, NodeKind, RunLog};

use crate::loop_node::LoopHandles;

/// Boxed stream of node events, borrowed from the executing node.
pub type NodeEventStream<'a> = Pin<Box<dyn Stream<Item = NodeEvent> + Send + 'a>>;

// ---------------------------------------------------------------------------
// NodeCore
// ---------------------------------------------------------------------------

/// State shared by every node kind.
#[derive(Debug, Clone)]
pub struct NodeCore {
    pub id: String,
    pub kind: NodeKind,
    /// Values received on input handles (envelope already unwrapped).
    pub inputs: HashMap<String, Value>,
    /// Values produced on output handles, envelope-wrapped.
    pub outputs: HashMap<String, Envelope>,
    /// `None` until the node has executed; distinguishes never-executed
    /// from executed-produced-nothing.
    pub response: Option<Value>,
    pub bypassed: bool,
    /// Honored by the loop sub-executor: reset between iterations.
    pub iterate: bool,
    pub debug: bool,
}

impl NodeCore {
    pub fn new(id: &str, kind: NodeKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            response: None,
            bypassed: false,
            iterate: false,
            debug: false,
        }
    }

    /// Store a parent node's output under one of this node's input handles.
    /// The envelope is unwrapped so downstream code sees the payload with
    /// its original type.
    pub fn add_parent(
        &mut self,
        outputs: &HashMap<String, Envelope>,
        source_handle: &str,
        target_handle: &str,
    ) {
        if let Some(envelope) = outputs.get(source_handle) {
            self.inputs
                .insert(target_handle.to_string(), envelope.content.clone());
        }
    }

    /// Record that this node was skipped, preserving inputs seen so far.
    pub fn mark_bypassed(&mut self) {
        self.bypassed = true;
    }

    pub fn was_executed(&self) -> bool {
        self.response.is_some()
    }

    /// Mark the node as executed even when it produced no output.
    pub fn mark_executed(&mut self) {
        if self.response.is_none() {
            self.response = Some(Value::Null);
        }
    }

    /// Clear execution state for re-execution inside a loop iteration.
    pub fn reset(&mut self) {
        self.response = None;
        self.outputs.clear();
    }

    pub fn clear_input(&mut self, handle: &str) {
        self.inputs.remove(handle);
    }

    pub fn get_input(&self, handle: &str) -> Option<&Value> {
        self.inputs.get(handle)
    }

    /// Input coerced to a string (JSON-encoded for non-strings).
    pub fn input_string(&self, handle: &str) -> Option<String> {
        self.inputs.get(handle).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn has_any_input(&self) -> bool {
        self.inputs.values().any(|v| !v.is_null())
    }

    /// Wrap a payload in this node's output envelope.
    pub fn envelope(&self, content: Value) -> Envelope {
        Envelope::new(self.kind.as_str(), content)
    }

    /// The debug record for an error raised inside this node's stream.
    pub fn debug_error(&self, error_type: &str, message: &str, context: Value) -> NodeEvent {
        NodeEvent::debug(json!({
            "node_id": self.id,
            "node_type": self.kind.as_str(),
            "error_type": error_type,
            "error_message": message,
            "context": context,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    /// Snapshot used for execution summaries.
    pub fn debug_info(&self) -> Value {
        let outputs: Map<String, Value> = self
            .outputs
            .iter()
            .map(|(handle, envelope)| (handle.clone(), envelope.to_value()))
            .collect();
        json!({
            "node_id": self.id,
            "node_type": self.kind.as_str(),
            "inputs": self.inputs,
            "outputs": outputs,
            "was_executed": self.was_executed(),
            "was_bypassed": self.bypassed,
        })
    }
}

// ---------------------------------------------------------------------------
// FlowNode
// ---------------------------------------------------------------------------

/// The capability set every node exposes to the engine.
pub trait FlowNode: Send {
    fn core(&self) -> &NodeCore;
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Execute the node, producing its async event sequence.
    fn call<'a>(&'a mut self, run: &'a RunLog) -> NodeEventStream<'a>;

    fn id(&self) -> &str {
        &self.core().id
    }

    fn kind(&self) -> NodeKind {
        self.core().kind
    }

    /// Node-specific internal state captured into node-end debug events.
    fn internal_state(&self) -> Value {
        json!({})
    }

    /// Conditionals: the handle chosen by the last execution.
    fn selected_handle(&self) -> Option<&str> {
        None
    }

    /// Conditionals: the configured fallback handle.
    fn default_handle(&self) -> Option<&str> {
        None
    }

    /// Loop nodes: their reserved handle names.
    fn loop_handles(&self) -> Option<&LoopHandles> {
        None
    }

    /// Loop nodes: the configured iteration cap.
    fn max_iterations(&self) -> Option<usize> {
        None
    }

    /// Clear streaming accumulators between loop iterations.
    fn iteration_reset(&mut self) {}

    /// Inner nodes: the raw nested graph description, for the builder.
    fn inner_flow_spec(&self) -> Option<&Value> {
        None
    }

    /// Inner nodes: receive the built sub-flow. Returns `false` for every
    /// other kind.
    fn attach_sub_flow(&mut self, _sub: Box<dyn crate::inner::SubFlow>) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Loop node: iterates over a list of items and aggregates per-iteration
//! feedback.
//!
//! The loop sub-executor in the engine drives iteration for graphs that
//! contain one of these; the node's own `call` covers the standalone
//! contract (validate the list, emit each item, then the aggregate).

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::LoopData;
use weir_types::{Envelope, NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_INPUT_LIST: &str = "handle_list";
pub const DEFAULT_INPUT_LOOP: &str = "handle_loop";
pub const DEFAULT_OUTPUT_ITEM: &str = "handle_item";
pub const DEFAULT_OUTPUT_END: &str = "handle_end";

/// The loop node's reserved handle names, after per-node overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopHandles {
    pub list: String,
    pub feedback: String,
    pub item: String,
    pub end: String,
}

impl Default for LoopHandles {
    fn default() -> Self {
        Self {
            list: DEFAULT_INPUT_LIST.to_string(),
            feedback: DEFAULT_INPUT_LOOP.to_string(),
            item: DEFAULT_OUTPUT_ITEM.to_string(),
            end: DEFAULT_OUTPUT_END.to_string(),
        }
    }
}

pub struct LoopNode {
    core: NodeCore,
    handles: LoopHandles,
    max_iterations: Option<usize>,
}

impl LoopNode {
    pub fn new(id: &str, data: LoopData) -> Self {
        let handles = LoopHandles {
            list: data.handles.resolve(&["input_list", "list"], DEFAULT_INPUT_LIST),
            feedback: data.handles.resolve(&["input_loop", "loop"], DEFAULT_INPUT_LOOP),
            item: data.handles.resolve(&["output_item", "item"], DEFAULT_OUTPUT_ITEM),
            end: data.handles.resolve(&["output_end", "end"], DEFAULT_OUTPUT_END),
        };
        let mut core = NodeCore::new(id, NodeKind::Loop);
        core.iterate = true;
        Self {
            core,
            handles,
            max_iterations: data.max_iterations,
        }
    }

    /// Decode the list input: an already-decoded array or a JSON-encoded
    /// string. Returns `(error_type, message)` on failure.
    pub fn decode_list(raw: &Value) -> Result<Vec<Value>, (&'static str, String)> {
        let decoded = match raw {
            Value::String(text) => serde_json::from_str::<Value>(text)
                .map_err(|err| ("JSONParseError", format!("invalid JSON list: {err}")))?,
            other => other.clone(),
        };
        match decoded {
            Value::Array(items) => Ok(items),
            other => Err((
                "ValidationError",
                format!(
                    "loop expects a list, got {}",
                    weir_types::json_type_name(&other)
                ),
            )),
        }
    }
}

impl FlowNode for LoopNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn loop_handles(&self) -> Option<&LoopHandles> {
        Some(&self.handles)
    }

    fn max_iterations(&self) -> Option<usize> {
        self.max_iterations
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            let Some(raw) = self.core.get_input(&self.handles.list).cloned() else {
                yield self.core.debug_error(
                    "InputError",
                    &format!("loop requires input '{}' with a list of items", self.handles.list),
                    json!({
                        "available_inputs": self.core.inputs.keys().collect::<Vec<_>>(),
                        "required_input": self.handles.list,
                    }),
                );
                return;
            };

            let items = match Self::decode_list(&raw) {
                Ok(items) => items,
                Err((error_type, message)) => {
                    yield self.core.debug_error(
                        error_type,
                        &message,
                        json!({
                            "value_preview": weir_types::preview_of(&raw, 200),
                        }),
                    );
                    return;
                }
            };

            tracing::info!(node = %self.core.id, items = items.len(), "loop iterating");
            for (index, item) in items.iter().enumerate() {
                yield NodeEvent::output(
                    self.handles.item.clone(),
                    Envelope::item(self.core.kind.as_str(), item.clone(), index),
                );
            }

            let aggregate = self
                .core
                .get_input(&self.handles.feedback)
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            yield NodeEvent::output(
                self.handles.end.clone(),
                self.core.envelope(aggregate),
            );
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "iterate": true,
            "input_handle_list": self.handles.list,
            "input_handle_loop": self.handles.feedback,
            "output_handle_item": self.handles.item,
            "output_handle_end": self.handles.end,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

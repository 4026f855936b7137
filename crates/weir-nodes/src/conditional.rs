//! Branching node: renders a Jinja condition to the name of the output
//! handle that continues execution.
//!
//! All inputs are merged into the render context. Failures emit the
//! matching debug event followed by the reserved `__bypass_all__` signal so
//! the dispatcher can prune every downstream path.

use async_stream::stream;
use minijinja::ErrorKind;
use serde_json::{json, Map, Value};

use weir_schema::{ConditionalData, MergeStrategy};
use weir_types::{NodeEvent, NodeKind, RunLog, SIGNAL_BYPASS_ALL};

use crate::node::{FlowNode, NodeCore, NodeEventStream};
use crate::template;

pub const DEFAULT_INPUT_HANDLE: &str = "handle_input";

pub struct ConditionalNode {
    core: NodeCore,
    condition: String,
    merge_strategy: MergeStrategy,
    input_handle: String,
    output_handles: Option<Vec<String>>,
    default_handle: Option<String>,
    init_error: Option<String>,
    selected: Option<String>,
    collisions: Vec<Value>,
}

impl ConditionalNode {
    pub fn new(id: &str, data: ConditionalData) -> Self {
        let input_handle = data
            .handles
            .resolve(&["input", "context"], DEFAULT_INPUT_HANDLE);
        let init_error = {
            let problems = data.check();
            if problems.is_empty() {
                None
            } else {
                Some(problems.join("; "))
            }
        };
        Self {
            core: NodeCore::new(id, NodeKind::Conditional),
            condition: data.condition,
            merge_strategy: data.merge_strategy,
            input_handle,
            output_handles: data.output_handles,
            default_handle: data.default_handle,
            init_error,
            selected: None,
            collisions: Vec::new(),
        }
    }

    pub fn output_handles(&self) -> Option<&[String]> {
        self.output_handles.as_deref()
    }

    /// Merge all inputs into one render context. Flat merge spreads object
    /// inputs (tracking key collisions); namespaced merge keys everything by
    /// handle. The primary input is always aliased as `value`.
    fn merge_inputs(&mut self) -> Option<Map<String, Value>> {
        self.collisions.clear();
        let mut merged = Map::new();
        let mut key_sources: Map<String, Value> = Map::new();

        let available: Vec<(String, Value)> = self
            .core
            .inputs
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(handle, value)| (handle.clone(), template::soft_json_parse(value)))
            .collect();

        if available.is_empty() {
            return None;
        }

        for (handle, parsed) in available {
            match self.merge_strategy {
                MergeStrategy::Namespaced => {
                    if handle == self.input_handle {
                        merged
                            .entry("value".to_string())
                            .or_insert_with(|| parsed.clone());
                    }
                    merged.insert(handle, parsed);
                }
                MergeStrategy::Flat => {
                    if handle == self.input_handle {
                        merged
                            .entry("value".to_string())
                            .or_insert_with(|| parsed.clone());
                    }
                    match parsed {
                        Value::Object(map) => {
                            for (key, value) in map {
                                if merged.contains_key(&key) {
                                    self.collisions.push(json!({
                                        "key": key,
                                        "previous_handle": key_sources.get(&key),
                                        "new_handle": handle,
                                    }));
                                }
                                key_sources
                                    .insert(key.clone(), Value::String(handle.clone()));
                                merged.insert(key, value);
                            }
                        }
                        other => {
                            if merged.contains_key(&handle) {
                                self.collisions.push(json!({
                                    "key": handle,
                                    "type": "handle_collision",
                                }));
                            }
                            key_sources
                                .insert(handle.clone(), Value::String(handle.clone()));
                            merged.insert(handle, other);
                        }
                    }
                }
            }
        }

        if !self.collisions.is_empty() {
            tracing::warn!(
                node = %self.core.id,
                collisions = self.collisions.len(),
                "key collisions during flat merge"
            );
        }

        Some(merged)
    }

    fn template_error_type(err: &minijinja::Error) -> &'static str {
        match err.kind() {
            ErrorKind::SyntaxError => "TemplateSyntaxError",
            ErrorKind::UndefinedError => "TemplateError",
            _ => "TemplateEvaluationError",
        }
    }
}

impl FlowNode for ConditionalNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn selected_handle(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn default_handle(&self) -> Option<&str> {
        self.default_handle.as_deref()
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            if let Some(message) = self.init_error.clone() {
                yield self.core.debug_error(
                    "ConfigurationError",
                    &message,
                    json!({"condition": self.condition}),
                );
                yield NodeEvent::signal(SIGNAL_BYPASS_ALL);
                return;
            }

            let Some(context) = self.merge_inputs() else {
                yield self.core.debug_error(
                    "InputError",
                    "conditional requires at least one input; no data received on any handle",
                    json!({
                        "available_handles": self.core.inputs.keys().collect::<Vec<_>>(),
                        "condition": self.condition,
                    }),
                );
                yield NodeEvent::signal(SIGNAL_BYPASS_ALL);
                return;
            };

            let env = template::environment();
            let rendered = env.render_str(
                &self.condition,
                minijinja::value::Value::from_serialize(&context),
            );

            let mut selected = match rendered {
                Ok(out) => out.trim().to_string(),
                Err(err) => {
                    yield self.core.debug_error(
                        Self::template_error_type(&err),
                        &err.to_string(),
                        json!({
                            "condition": self.condition,
                            "available_context_keys": context.keys().collect::<Vec<_>>(),
                        }),
                    );
                    yield NodeEvent::signal(SIGNAL_BYPASS_ALL);
                    return;
                }
            };

            if selected.is_empty() {
                match &self.default_handle {
                    Some(default) => {
                        tracing::warn!(
                            node = %self.core.id,
                            default = %default,
                            "condition rendered empty, falling back to default handle"
                        );
                        selected = default.clone();
                    }
                    None => {
                        yield self.core.debug_error(
                            "EmptyHandleError",
                            "condition evaluated to an empty string and no default_handle is configured",
                            json!({
                                "condition": self.condition,
                                "context_keys": context.keys().collect::<Vec<_>>(),
                            }),
                        );
                        yield NodeEvent::signal(SIGNAL_BYPASS_ALL);
                        return;
                    }
                }
            }

            tracing::debug!(node = %self.core.id, selected = %selected, "condition evaluated");
            self.selected = Some(selected.clone());
            yield NodeEvent::output(
                selected,
                self.core.envelope(Value::Object(context)),
            );
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "condition": self.condition,
            "merge_strategy": self.merge_strategy,
            "output_handles": self.output_handles,
            "default_handle": self.default_handle,
            "selected_handle": self.selected,
            "merge_collisions": if self.collisions.is_empty() {
                Value::Null
            } else {
                Value::Array(self.collisions.clone())
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

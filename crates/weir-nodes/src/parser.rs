//! Template parser node: renders a Jinja template with the node's inputs.

use std::collections::HashMap;

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::ParserData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};
use crate::template;

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_parser_output";

pub struct ParserNode {
    core: NodeCore,
    text: String,
    output_handle: String,
}

impl ParserNode {
    pub fn new(id: &str, data: ParserData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "result"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::Parser),
            text: data.text,
            output_handle,
        }
    }
}

impl FlowNode for ParserNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            // JSON-decode string inputs so templates can address nested fields.
            let params: HashMap<String, Value> = self
                .core
                .inputs
                .iter()
                .map(|(handle, value)| (handle.clone(), template::soft_json_parse(value)))
                .collect();

            tracing::debug!(node = %self.core.id, inputs = params.len(), "parsing template");
            match template::render(&self.text, &params) {
                Ok(output) => {
                    tracing::info!(node = %self.core.id, output_len = output.len(), "template parsed");
                    yield NodeEvent::output(
                        self.output_handle.clone(),
                        self.core.envelope(Value::String(output)),
                    );
                }
                Err(err) => {
                    yield self.core.debug_error(
                        "TemplateError",
                        &err.to_string(),
                        json!({
                            "template_preview": weir_types::preview_of(&Value::String(self.text.clone()), 200),
                            "available_inputs": params.keys().collect::<Vec<_>>(),
                        }),
                    );
                }
            }
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "template_length": self.text.len(),
        })
    }
}

//! Nested sub-graph node.
//!
//! Holds a pre-built sub-flow behind the [`SubFlow`] trait (injected by the
//! builder, which keeps this crate independent of the engine). The inner
//! run's content and debug records are forwarded to the outer stream; the
//! accumulated content becomes this node's handle output.

use std::pin::Pin;

use async_stream::stream;
use futures_core::Stream;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use weir_schema::Handles;
use weir_types::{FlowEvent, NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_INPUT_HANDLE: &str = "handle_user_message";
pub const DEFAULT_OUTPUT_CONTENT: &str = "handle_execution_content";

/// A built, executable nested flow.
pub trait SubFlow: Send {
    /// Run the nested flow with the given request message, yielding its
    /// output stream.
    fn run<'a>(
        &'a mut self,
        message: String,
        run: &'a RunLog,
    ) -> Pin<Box<dyn Stream<Item = FlowEvent> + Send + 'a>>;
}

pub struct InnerNode {
    core: NodeCore,
    flow_spec: Value,
    sub: Option<Box<dyn SubFlow>>,
    input_handle: String,
    output_handle: String,
}

impl InnerNode {
    pub fn new(id: &str, flow_spec: Value, handles: Handles) -> Self {
        let input_handle = handles.resolve(&["input", "message"], DEFAULT_INPUT_HANDLE);
        let output_handle = handles.resolve(&["output", "content"], DEFAULT_OUTPUT_CONTENT);
        Self {
            core: NodeCore::new(id, NodeKind::Inner),
            flow_spec,
            sub: None,
            input_handle,
            output_handle,
        }
    }
}

impl FlowNode for InnerNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn inner_flow_spec(&self) -> Option<&Value> {
        Some(&self.flow_spec)
    }

    fn attach_sub_flow(&mut self, sub: Box<dyn SubFlow>) -> bool {
        self.sub = Some(sub);
        true
    }

    fn call<'a>(&'a mut self, run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            let Some(message) = self.core.input_string(&self.input_handle) else {
                yield self.core.debug_error(
                    "InputError",
                    &format!("inner flow requires input '{}'", self.input_handle),
                    json!({
                        "available_inputs": self.core.inputs.keys().collect::<Vec<_>>(),
                        "required_input": self.input_handle,
                    }),
                );
                return;
            };

            let Some(sub) = self.sub.as_mut() else {
                yield self.core.debug_error(
                    "ConfigurationError",
                    "inner flow was not built; the graph builder did not attach a sub-flow",
                    json!({"has_flow_spec": !self.flow_spec.is_null()}),
                );
                return;
            };

            tracing::info!(node = %self.core.id, "executing inner flow");
            let mut accumulated = String::new();
            {
                let mut inner = sub.run(message, run);
                while let Some(event) = inner.next().await {
                    match event {
                        FlowEvent::Content { content, .. } => {
                            if let Some(text) = content.as_str() {
                                accumulated.push_str(text);
                            } else if let Some(text) =
                                content.get("content").and_then(|c| c.as_str())
                            {
                                accumulated.push_str(text);
                            }
                            yield NodeEvent::content(content);
                        }
                        FlowEvent::Debug { content, .. } => {
                            yield NodeEvent::debug(content);
                        }
                        // Inner summaries and loop progress stay internal to
                        // the nested run.
                        FlowEvent::DebugSummary { .. } | FlowEvent::LoopProgress { .. } => {}
                    }
                }
            }

            yield NodeEvent::output(
                self.output_handle.clone(),
                self.core.envelope(Value::String(accumulated)),
            );
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoFlow;

    impl SubFlow for EchoFlow {
        fn run<'a>(
            &'a mut self,
            message: String,
            _run: &'a RunLog,
        ) -> Pin<Box<dyn Stream<Item = FlowEvent> + Send + 'a>> {
            Box::pin(stream! {
                yield FlowEvent::content(json!({"content": format!("echo: {message}")}), None);
                yield FlowEvent::Debug {
                    content: json!({"note": "inner debug"}),
                    event_type: None,
                };
                yield FlowEvent::DebugSummary { content: json!({}) };
            })
        }
    }

    #[tokio::test]
    async fn forwards_inner_stream_and_accumulates_content() {
        let mut node = InnerNode::new("i1", json!({"nodes": [], "edges": []}), Handles::default());
        assert!(node.attach_sub_flow(Box::new(EchoFlow)));
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_HANDLE.into(), json!("hi"));

        let run = RunLog::new();
        let events: Vec<NodeEvent> = node.call(&run).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, weir_types::EVENT_CONTENT);
        assert_eq!(events[1].kind, weir_types::EVENT_DEBUG);
        assert_eq!(events[2].kind, DEFAULT_OUTPUT_CONTENT);
        assert_eq!(events[2].content["content"], "echo: hi");
    }

    #[tokio::test]
    async fn missing_input_is_input_error() {
        let mut node = InnerNode::new("i1", json!({}), Handles::default());
        node.attach_sub_flow(Box::new(EchoFlow));

        let run = RunLog::new();
        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events[0].content["error_type"], "InputError");
    }

    #[tokio::test]
    async fn missing_sub_flow_is_configuration_error() {
        let mut node = InnerNode::new("i1", json!({}), Handles::default());
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_HANDLE.into(), json!("hi"));

        let run = RunLog::new();
        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events[0].content["error_type"], "ConfigurationError");
    }
}

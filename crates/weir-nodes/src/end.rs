//! Terminal node. The builder wires every end node to the synthetic void
//! terminal; executing one just emits an empty completion record.

use async_stream::stream;
use serde_json::json;

use weir_schema::Handles;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_end_output";

pub struct EndNode {
    core: NodeCore,
    output_handle: String,
}

impl EndNode {
    pub fn new(id: &str, handles: Handles) -> Self {
        let output_handle = handles.resolve(&["output", "end"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::End),
            output_handle,
        }
    }

    /// The synthetic terminal inserted by the builder.
    pub fn terminal(id: &str) -> Self {
        let mut node = Self::new(id, Handles::default());
        node.core.kind = NodeKind::Void;
        node
    }
}

impl FlowNode for EndNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            tracing::info!(node = %self.core.id, "end node reached");
            yield NodeEvent::output(
                self.output_handle.clone(),
                self.core.envelope(json!({"id": "", "model": "", "choices": []})),
            );
        })
    }

    fn internal_state(&self) -> serde_json::Value {
        json!({"is_terminal_node": true})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn emits_empty_completion() {
        let mut node = EndNode::new("e1", Handles::default());
        let run = RunLog::new();
        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DEFAULT_OUTPUT_HANDLE);
        assert_eq!(events[0].content["content"]["model"], "");
    }

    #[test]
    fn terminal_constructor_uses_void_kind() {
        let node = EndNode::terminal("void-1");
        assert_eq!(node.kind(), NodeKind::Void);
    }
}

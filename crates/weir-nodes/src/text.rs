//! Static text source node.

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::TextData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_text_output";

pub struct TextNode {
    core: NodeCore,
    text: String,
    output_handle: String,
}

impl TextNode {
    pub fn new(id: &str, data: TextData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "text"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::Text),
            text: data.text,
            output_handle,
        }
    }
}

impl FlowNode for TextNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            tracing::info!(node = %self.core.id, len = self.text.len(), "text node yielding static text");
            yield NodeEvent::output(
                self.output_handle.clone(),
                self.core.envelope(Value::String(self.text.clone())),
            );
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "text_length": self.text.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn yields_text_on_output_handle() {
        let data = TextData {
            text: "hello".into(),
            ..Default::default()
        };
        let mut node = TextNode::new("t1", data);
        let run = RunLog::new();

        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DEFAULT_OUTPUT_HANDLE);
        assert_eq!(events[0].content["content"], "hello");
        assert_eq!(events[0].content["producer"], "text");
    }

    #[tokio::test]
    async fn honors_handle_override() {
        let data: TextData = weir_schema::node_data(&serde_json::json!({
            "text": "x",
            "handles": {"output": "my_out"}
        }))
        .unwrap();
        let mut node = TextNode::new("t1", data);
        let run = RunLog::new();

        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events[0].kind, "my_out");
    }
}

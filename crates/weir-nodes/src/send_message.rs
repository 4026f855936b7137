//! Emits a fixed message as one streaming-content chunk.

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::SendMessageData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_message_output";

pub struct SendMessageNode {
    core: NodeCore,
    text: String,
    extras: Option<Value>,
    output_handle: String,
}

impl SendMessageNode {
    pub fn new(id: &str, data: SendMessageData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "message"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::SendMessage),
            text: data.text,
            extras: data.extras,
            output_handle,
        }
    }
}

impl FlowNode for SendMessageNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            let chunk = json!({
                "id_chat": run.id_chat,
                "content": self.text,
                "extras": self.extras,
            });
            yield NodeEvent::content(chunk);
            yield NodeEvent::output(
                self.output_handle.clone(),
                self.core.envelope(Value::String(self.text.clone())),
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn streams_text_then_output() {
        let data = SendMessageData {
            text: "done!".into(),
            extras: Some(json!({"badge": 1})),
            ..Default::default()
        };
        let mut node = SendMessageNode::new("s1", data);
        let run = RunLog::new().with_chat("c-9");

        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, weir_types::EVENT_CONTENT);
        assert_eq!(events[0].content["content"], "done!");
        assert_eq!(events[0].content["id_chat"], "c-9");
        assert_eq!(events[0].content["extras"]["badge"], 1);
        assert_eq!(events[1].kind, DEFAULT_OUTPUT_HANDLE);
    }
}

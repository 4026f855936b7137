//! Chat assembly node: builds the message list consumed by LLM nodes.

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::ChatData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};
use crate::template::soft_json_parse;

pub const DEFAULT_INPUT_SYSTEM: &str = "handle-system-context";
pub const DEFAULT_INPUT_MESSAGE: &str = "handle_user_message";
pub const DEFAULT_INPUT_MESSAGES: &str = "handle_messages";
pub const DEFAULT_INPUT_FILES: &str = "handle_user_files";
pub const DEFAULT_INPUT_IMAGES: &str = "handle_user_images";
pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_chat_output";

pub struct ChatNode {
    core: NodeCore,
    seed_message: String,
    system_handle: String,
    message_handle: String,
    messages_handle: String,
    images_handle: String,
    output_handle: String,
}

impl ChatNode {
    pub fn new(id: &str, data: ChatData) -> Self {
        let system_handle = data
            .handles
            .resolve(&["system_context", "system"], DEFAULT_INPUT_SYSTEM);
        let message_handle = data
            .handles
            .resolve(&["user_message", "message"], DEFAULT_INPUT_MESSAGE);
        let messages_handle = data.handles.resolve(&["messages"], DEFAULT_INPUT_MESSAGES);
        let images_handle = data
            .handles
            .resolve(&["user_images", "images"], DEFAULT_INPUT_IMAGES);
        let output_handle = data
            .handles
            .resolve(&["output", "chat"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::Chat),
            seed_message: data.message,
            system_handle,
            message_handle,
            messages_handle,
            images_handle,
            output_handle,
        }
    }

    /// Images must be uniformly shaped: either all bare URLs or all
    /// `[url, detail]` pairs, never mixed.
    fn image_shapes_conflict(images: &[Value]) -> bool {
        let has_single = images.iter().any(|i| i.is_string());
        let has_pair = images.iter().any(|i| i.is_array());
        has_single && has_pair
    }
}

impl FlowNode for ChatNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            // An explicit messages input replaces assembly entirely.
            if let Some(messages) = self.core.get_input(&self.messages_handle) {
                let messages = soft_json_parse(messages);
                tracing::debug!(node = %self.core.id, "loading messages directly");
                yield NodeEvent::output(
                    self.output_handle.clone(),
                    self.core.envelope(json!({"messages": messages})),
                );
                return;
            }

            let mut messages: Vec<Value> = Vec::new();
            if let Some(system) = self.core.input_string(&self.system_handle) {
                messages.push(json!({"role": "system", "content": system}));
            }

            let user_message = self
                .core
                .input_string(&self.message_handle)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| self.seed_message.clone());

            if !user_message.is_empty() {
                let images = self
                    .core
                    .get_input(&self.images_handle)
                    .map(soft_json_parse)
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();

                if Self::image_shapes_conflict(&images) {
                    yield self.core.debug_error(
                        "ValidationError",
                        "images must be either all single URLs or all [url, detail] pairs",
                        json!({"images_input": images}),
                    );
                    return;
                }

                if images.is_empty() {
                    messages.push(json!({"role": "user", "content": user_message}));
                } else {
                    messages.push(json!({
                        "role": "user",
                        "content": user_message,
                        "images": images,
                    }));
                }
            }

            yield NodeEvent::output(
                self.output_handle.clone(),
                self.core.envelope(json!({"messages": messages})),
            );
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "seed_message_length": self.seed_message.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn run(node: &mut ChatNode) -> Vec<NodeEvent> {
        let run = RunLog::new();
        node.call(&run).collect().await
    }

    #[tokio::test]
    async fn assembles_system_and_user_messages() {
        let mut node = ChatNode::new("ch1", ChatData::default());
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_SYSTEM.into(), json!("be brief"));
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_MESSAGE.into(), json!("hello"));

        let events = run(&mut node).await;
        let messages = &events[0].content["content"]["messages"];
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be brief");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
    }

    #[tokio::test]
    async fn explicit_messages_input_wins() {
        let mut node = ChatNode::new("ch1", ChatData::default());
        node.core_mut().inputs.insert(
            DEFAULT_INPUT_MESSAGES.into(),
            json!([{"role": "assistant", "content": "prior"}]),
        );
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_MESSAGE.into(), json!("ignored"));

        let events = run(&mut node).await;
        let messages = &events[0].content["content"]["messages"];
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_message_fills_missing_input() {
        let data = ChatData {
            message: "seeded".into(),
            ..Default::default()
        };
        let mut node = ChatNode::new("ch1", data);
        let events = run(&mut node).await;
        let messages = &events[0].content["content"]["messages"];
        assert_eq!(messages[0]["content"], "seeded");
    }

    #[tokio::test]
    async fn mixed_image_shapes_error() {
        let mut node = ChatNode::new("ch1", ChatData::default());
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_MESSAGE.into(), json!("look"));
        node.core_mut().inputs.insert(
            DEFAULT_INPUT_IMAGES.into(),
            json!(["img://1", ["img://2", "high"]]),
        );

        let events = run(&mut node).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content["error_type"], "ValidationError");
    }

    #[tokio::test]
    async fn uniform_images_attach_to_user_message() {
        let mut node = ChatNode::new("ch1", ChatData::default());
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_MESSAGE.into(), json!("look"));
        node.core_mut()
            .inputs
            .insert(DEFAULT_INPUT_IMAGES.into(), json!(["img://1", "img://2"]));

        let events = run(&mut node).await;
        let messages = &events[0].content["content"]["messages"];
        assert_eq!(messages[0]["images"][1], "img://2");
    }
}

//! Entry node carrying the caller's message, files, and images.

use async_stream::stream;
use serde_json::{json, Value};

use weir_schema::UserInputData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_OUTPUT_MESSAGE: &str = "handle_user_message";
pub const DEFAULT_OUTPUT_FILES: &str = "handle_user_files";
pub const DEFAULT_OUTPUT_IMAGES: &str = "handle_user_images";

pub struct UserInputNode {
    core: NodeCore,
    text: String,
    files: Option<Vec<Value>>,
    images: Option<Vec<Value>>,
    message_handle: String,
    files_handle: String,
    images_handle: String,
}

impl UserInputNode {
    pub fn new(id: &str, data: UserInputData) -> Self {
        let message_handle = data
            .handles
            .resolve(&["user_message", "message"], DEFAULT_OUTPUT_MESSAGE);
        let files_handle = data
            .handles
            .resolve(&["user_files", "files"], DEFAULT_OUTPUT_FILES);
        let images_handle = data
            .handles
            .resolve(&["user_images", "images"], DEFAULT_OUTPUT_IMAGES);
        Self {
            core: NodeCore::new(id, NodeKind::UserInput),
            text: data.text,
            files: data.files,
            images: data.images,
            message_handle,
            files_handle,
            images_handle,
        }
    }
}

impl FlowNode for UserInputNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            tracing::info!(
                node = %self.core.id,
                text_len = self.text.len(),
                files = self.files.as_ref().map(|f| f.len()).unwrap_or(0),
                images = self.images.as_ref().map(|i| i.len()).unwrap_or(0),
                "user input node"
            );
            yield NodeEvent::output(
                self.message_handle.clone(),
                self.core.envelope(Value::String(self.text.clone())),
            );
            yield NodeEvent::output(
                self.files_handle.clone(),
                self.core.envelope(match &self.files {
                    Some(files) => Value::Array(files.clone()),
                    None => Value::Null,
                }),
            );
            yield NodeEvent::output(
                self.images_handle.clone(),
                self.core.envelope(match &self.images {
                    Some(images) => Value::Array(images.clone()),
                    None => Value::Null,
                }),
            );
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "text": self.text,
            "files": self.files.clone().unwrap_or_default(),
            "images": self.images.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn yields_message_files_and_images() {
        let data = UserInputData {
            text: "what is a weir?".into(),
            images: Some(vec![json!("img://1")]),
            ..Default::default()
        };
        let mut node = UserInputNode::new("u1", data);
        let run = RunLog::new();

        let events: Vec<NodeEvent> = node.call(&run).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, DEFAULT_OUTPUT_MESSAGE);
        assert_eq!(events[0].content["content"], "what is a weir?");
        assert_eq!(events[1].kind, DEFAULT_OUTPUT_FILES);
        assert_eq!(events[1].content["content"], Value::Null);
        assert_eq!(events[2].kind, DEFAULT_OUTPUT_IMAGES);
        assert_eq!(events[2].content["content"][0], "img://1");
    }
}

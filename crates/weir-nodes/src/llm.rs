//! LLM completion node.
//!
//! Builds a chat request from its inputs, calls the provider through
//! `weir-llm`, forwards streamed deltas as streaming-content events, and
//! emits the accumulated text as its handle output.

use async_stream::stream;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use weir_llm::{ChatMessage, ClientConfig, LlmClient, Role};
use weir_schema::LlmData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};
use crate::template::soft_json_parse;

pub const INPUT_CLIENT_PROVIDER: &str = "handle-client-provider";
pub const INPUT_CHAT: &str = "handle-chat";
pub const INPUT_SYSTEM_CONTEXT: &str = "handle-system-context";
pub const INPUT_USER_MESSAGE: &str = "handle_user_message";
pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_llm_output";

pub struct LlmNode {
    core: NodeCore,
    stream: bool,
    json_output: bool,
    extra: serde_json::Map<String, Value>,
    output_handle: String,
    generated: String,
}

impl LlmNode {
    pub fn new(id: &str, data: LlmData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "generated"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::Llm),
            stream: data.stream,
            json_output: data.json_output,
            extra: data.extra_data,
            output_handle,
            generated: String::new(),
        }
    }

    /// The message list: an explicit chat input wins; otherwise assemble
    /// from system context + user message.
    fn build_messages(&self) -> Result<Vec<ChatMessage>, (&'static str, String)> {
        if let Some(chat) = self.core.get_input(INPUT_CHAT) {
            let chat = soft_json_parse(chat);
            let list = match &chat {
                Value::Array(items) => items.clone(),
                Value::Object(map) => map
                    .get("messages")
                    .and_then(|m| m.as_array())
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let mut messages = Vec::new();
            for item in list {
                let role = match item["role"].as_str() {
                    Some("system") => Role::System,
                    Some("assistant") => Role::Assistant,
                    _ => Role::User,
                };
                let content = item["content"].as_str().unwrap_or_default().to_string();
                messages.push(ChatMessage { role, content });
            }
            return Ok(messages);
        }

        let mut messages = Vec::new();
        if let Some(system) = self.core.input_string(INPUT_SYSTEM_CONTEXT) {
            messages.push(ChatMessage::system(system));
        }
        match self.core.input_string(INPUT_USER_MESSAGE) {
            Some(user) if !user.is_empty() => messages.push(ChatMessage::user(user)),
            _ => {
                return Err((
                    "InputError",
                    "no message provided: expected a chat or user message input".to_string(),
                ))
            }
        }
        Ok(messages)
    }

    fn build_client(&self) -> Result<LlmClient, (&'static str, String)> {
        let Some(raw) = self.core.get_input(INPUT_CLIENT_PROVIDER) else {
            return Err((
                "InputError",
                format!("missing required input '{INPUT_CLIENT_PROVIDER}'"),
            ));
        };
        let config: ClientConfig = serde_json::from_value(raw.clone())
            .map_err(|err| ("ConfigurationError", format!("invalid client config: {err}")))?;
        LlmClient::from_config(&config)
            .map_err(|err| ("ConfigurationError", err.to_string()))
    }
}

impl FlowNode for LlmNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn iteration_reset(&mut self) {
        self.generated.clear();
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            let client = match self.build_client() {
                Ok(client) => client,
                Err((error_type, message)) => {
                    yield self.core.debug_error(error_type, &message, json!({}));
                    return;
                }
            };
            let messages = match self.build_messages() {
                Ok(messages) => messages,
                Err((error_type, message)) => {
                    yield self.core.debug_error(
                        error_type,
                        &message,
                        json!({"available_inputs": self.core.inputs.keys().collect::<Vec<_>>()}),
                    );
                    return;
                }
            };

            self.generated.clear();
            if self.stream {
                let mut stream_error = None;
                {
                    let mut deltas = client.stream_generate(messages, self.extra.clone());
                    while let Some(delta) = deltas.next().await {
                        match delta {
                            Ok(delta) => {
                                self.generated.push_str(&delta.content);
                                yield NodeEvent::content(json!({
                                    "content": delta.content,
                                    "finish_reason": delta.finish_reason,
                                    "model": client.model,
                                }));
                            }
                            Err(err) => {
                                // Already-yielded chunks stay on the stream;
                                // the failure surfaces as a debug event.
                                stream_error = Some(err);
                                break;
                            }
                        }
                    }
                }
                if let Some(err) = stream_error {
                    yield self.core.debug_error(
                        err.error_kind(),
                        &err.to_string(),
                        json!({"model": client.model}),
                    );
                    return;
                }
            } else {
                match client.generate(messages, self.extra.clone()).await {
                    Ok(response) => {
                        self.generated = response.text.clone();
                        yield NodeEvent::content(json!({
                            "id": response.id,
                            "model": response.model,
                            "usage": response.usage,
                        }));
                    }
                    Err(err) => {
                        yield self.core.debug_error(
                            err.error_kind(),
                            &err.to_string(),
                            json!({"model": client.model}),
                        );
                        return;
                    }
                }
            }

            let output = if self.json_output {
                match serde_json::from_str::<Value>(&self.generated) {
                    Ok(value) => value,
                    Err(err) => {
                        yield self.core.debug_error(
                            "JSONParseError",
                            &format!("model output is not valid JSON: {err}"),
                            json!({
                                "output_preview": weir_types::preview_of(
                                    &Value::String(self.generated.clone()),
                                    200,
                                ),
                            }),
                        );
                        return;
                    }
                }
            } else {
                Value::String(self.generated.clone())
            };

            yield NodeEvent::output(self.output_handle.clone(), self.core.envelope(output));
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "stream": self.stream,
            "json_output": self.json_output,
            "generated_length": self.generated.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

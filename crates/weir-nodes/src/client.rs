//! LLM client provider node.
//!
//! Emits the provider configuration as a handle value; downstream LLM nodes
//! rebuild a `weir_llm::LlmClient` from it. The api_key inside the emitted
//! record is covered by the debug pipeline's redact transformer.

use async_stream::stream;
use serde_json::{json, Value};

use weir_llm::ClientConfig;
use weir_schema::ClientData;
use weir_types::{NodeEvent, NodeKind, RunLog};

use crate::node::{FlowNode, NodeCore, NodeEventStream};

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle-client-provider";

pub struct ClientNode {
    core: NodeCore,
    config: Option<ClientConfig>,
    init_error: Option<String>,
    output_handle: String,
}

impl ClientNode {
    pub fn new(id: &str, data: ClientData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "client"], DEFAULT_OUTPUT_HANDLE);
        let (config, init_error) = match ClientConfig::assemble(
            &data.engine,
            &data.model,
            data.api_info.as_ref(),
            &data.extra_data,
        ) {
            Ok(config) => (Some(config), None),
            Err(err) => (None, Some(err.to_string())),
        };
        if let Some(message) = &init_error {
            tracing::error!(node = id, error = %message, "failed to assemble client config");
        } else {
            tracing::info!(node = id, "client config assembled");
        }
        Self {
            core: NodeCore::new(id, NodeKind::Client),
            config,
            init_error,
            output_handle,
        }
    }
}

impl FlowNode for ClientNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            match (&self.config, &self.init_error) {
                (Some(config), _) => {
                    yield NodeEvent::output(
                        self.output_handle.clone(),
                        self.core.envelope(config.to_value()),
                    );
                }
                (None, error) => {
                    let message = error.clone().unwrap_or_else(|| "no client config".into());
                    yield self.core.debug_error(
                        "ConfigurationError",
                        &format!("failed to initialize LLM client: {message}"),
                        json!({
                            "engine": self.config.as_ref().map(|c| c.engine.clone()),
                        }),
                    );
                }
            }
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "engine": self.config.as_ref().map(|c| c.engine.clone()),
            "model": self.config.as_ref().map(|c| c.model.clone()),
            "client_initialized": self.config.is_some(),
            "init_error": self.init_error,
        })
    }
}

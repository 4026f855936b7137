//! HTTP fetch node.
//!
//! Renders its configured body through the template engine with the node's
//! inputs, performs the request, and emits the JSON response. When no input
//! carries a value the request is skipped and an empty object is emitted.

use std::collections::HashMap;

use async_stream::stream;
use serde_json::{json, Map, Value};

use weir_schema::FetchData;
use weir_types::{NodeEvent, NodeKind, Result, RunLog, WeirError};

use crate::node::{FlowNode, NodeCore, NodeEventStream};
use crate::template;

pub const DEFAULT_OUTPUT_HANDLE: &str = "handle_fetch_output";

pub struct FetchNode {
    core: NodeCore,
    url: String,
    method: String,
    headers: Map<String, Value>,
    data: Option<Value>,
    json_data: Option<Value>,
    output_handle: String,
    client: reqwest::Client,
}

impl FetchNode {
    pub fn new(id: &str, data: FetchData) -> Self {
        let output_handle = data
            .handles
            .resolve(&["output", "response"], DEFAULT_OUTPUT_HANDLE);
        Self {
            core: NodeCore::new(id, NodeKind::Fetch),
            url: data.url,
            method: data.method.trim().to_uppercase(),
            headers: decode_headers(data.headers),
            data: data.data,
            json_data: data.json_data,
            output_handle,
            client: reqwest::Client::new(),
        }
    }

    /// Render a configured body template against the inputs and decode the
    /// result back to JSON.
    fn render_body(&self, body: &Value) -> Result<Value> {
        let params: HashMap<String, Value> = self
            .core
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let source = serde_json::to_string(body)?;
        let rendered = template::render(&source, &params)?;
        Ok(serde_json::from_str(&rendered)?)
    }

    async fn perform(&self) -> Result<Value> {
        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| WeirError::Other(format!("unsupported HTTP method '{}'", self.method)))?;

        let mut request = self.client.request(method, &self.url);
        for (key, value) in &self.headers {
            if let Some(text) = value.as_str() {
                request = request.header(key, text);
            }
        }

        if let Some(body) = &self.json_data {
            request = request.json(&self.render_body(body)?);
        } else if let Some(body) = &self.data {
            request = request.body(self.render_body(body)?.to_string());
        } else if self.method != "GET" {
            return Ok(json!({}));
        }

        let response = request
            .send()
            .await
            .map_err(|err| WeirError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WeirError::Http(format!(
                "{} {} returned {}",
                self.method, self.url, status
            )));
        }
        response
            .json()
            .await
            .map_err(|err| WeirError::Http(err.to_string()))
    }
}

fn decode_headers(headers: Option<Value>) -> Map<String, Value> {
    let default = || {
        let mut map = Map::new();
        map.insert("Accept".into(), json!("application/json"));
        map.insert("Content-Type".into(), json!("application/json"));
        map
    };
    match headers {
        None | Some(Value::Null) => default(),
        Some(Value::Object(map)) => map,
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => default(),
        },
        Some(_) => default(),
    }
}

impl FlowNode for FetchNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn call<'a>(&'a mut self, _run: &'a RunLog) -> NodeEventStream<'a> {
        Box::pin(stream! {
            if !self.core.has_any_input() {
                tracing::debug!(node = %self.core.id, "no inputs set; skipping request");
                yield NodeEvent::output(
                    self.output_handle.clone(),
                    self.core.envelope(json!({})),
                );
                return;
            }

            tracing::info!(node = %self.core.id, method = %self.method, url = %self.url, "fetching");
            match self.perform().await {
                Ok(response) => {
                    tracing::info!(node = %self.core.id, "request completed");
                    yield NodeEvent::output(
                        self.output_handle.clone(),
                        self.core.envelope(response),
                    );
                }
                Err(err) => {
                    yield self.core.debug_error(
                        err.error_kind(),
                        &err.to_string(),
                        json!({"url": self.url, "method": self.method}),
                    );
                }
            }
        })
    }

    fn internal_state(&self) -> Value {
        json!({
            "url": self.url,
            "method": self.method,
            "header_keys": self.headers.keys().collect::<Vec<_>>(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use weir_types::{Result, WeirError};

use crate::provider::{DeltaStream, ProviderAdapter};
use crate::{ChatDelta, ChatRequest, ChatResponse, Usage};

// ---------------------------------------------------------------------------
// OpenAiCompatAdapter
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI chat-completions wire format, which most hosted
/// engines in flow configs speak (OpenAI itself plus any compatible
/// gateway selected via `base_url`).
#[derive(Debug)]
pub struct OpenAiCompatAdapter {
    name: String,
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            name: "openai".to_string(),
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| WeirError::Auth {
            provider: "openai".into(),
        })?;
        Ok(Self::new(key))
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_name(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(map) = body.as_object_mut() {
            for (key, value) in &request.extra {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        body
    }

    fn parse_response(&self, body: Value) -> Result<ChatResponse> {
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage: Usage = serde_json::from_value(body["usage"].clone()).unwrap_or_default();

        Ok(ChatResponse {
            id: body["id"].as_str().unwrap_or_default().to_string(),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            text,
            usage,
            finish_reason: body["choices"][0]["finish_reason"]
                .as_str()
                .map(String::from),
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| WeirError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WeirError::Provider {
                provider: self.name.clone(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

/// Parse one `data: {...}` SSE payload into a delta, if it carries content.
fn parse_sse_payload(payload: &str) -> Option<ChatDelta> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let choice = value["choices"].get(0)?;
    let content = choice["delta"]["content"].as_str().unwrap_or_default();
    let finish_reason = choice["finish_reason"].as_str().map(String::from);
    if content.is_empty() && finish_reason.is_none() {
        return None;
    }
    Some(ChatDelta {
        content: content.to_string(),
        finish_reason,
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request_body(request, false);
        let response = self.send(&body).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|err| WeirError::Http(err.to_string()))?;
        self.parse_response(value)
    }

    fn stream(&self, request: &ChatRequest) -> DeltaStream<'_> {
        let body = self.build_request_body(request, true);
        Box::pin(async_stream::try_stream! {
            let response = self.send(&body).await?;
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|err| WeirError::Http(err.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Drain complete lines; a partial line stays in the buffer.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(delta) = parse_sse_payload(payload) {
                        yield delta;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

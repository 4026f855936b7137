use serde::{Deserialize, Serialize};
use serde_json::Value;

use weir_types::{Result, WeirError};

use crate::provider::{DeltaStream, DynProvider};
use crate::{ChatMessage, ChatRequest, ChatResponse, OpenAiCompatAdapter};

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Provider configuration carried between flow nodes.
///
/// A flow's client node emits this record as a handle value; the LLM node
/// rebuilds a client from it. The `api_info` of the graph dialect (object or
/// JSON-encoded string) is flattened into these fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl ClientConfig {
    /// Build from the pieces held by a client node's data: engine, model,
    /// `api_info` (object or JSON string) and pass-through extras.
    pub fn assemble(
        engine: &str,
        model: &str,
        api_info: Option<&Value>,
        extra_data: &serde_json::Map<String, Value>,
    ) -> Result<Self> {
        let mut info = match api_info {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(raw)) if raw.is_empty() => serde_json::Map::new(),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(WeirError::Other(format!(
                        "api_info must decode to an object, got {}",
                        weir_types::json_type_name(&other)
                    )))
                }
            },
            Some(other) => {
                return Err(WeirError::Other(format!(
                    "api_info must be an object or string, got {}",
                    weir_types::json_type_name(other)
                )))
            }
        };

        for (key, value) in extra_data {
            info.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let api_key = info
            .remove("api_key")
            .or_else(|| info.remove("private_key"))
            .and_then(|v| v.as_str().map(String::from));
        let base_url = info
            .remove("base_url")
            .and_then(|v| v.as_str().map(String::from));

        Ok(Self {
            engine: engine.to_string(),
            model: model.to_string(),
            api_key,
            base_url,
            extra: info,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// A provider plus the model it was configured for.
pub struct LlmClient {
    provider: DynProvider,
    pub model: String,
}

impl LlmClient {
    pub fn new(provider: DynProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Construct a client from a config record. Every known engine speaks
    /// the OpenAI-compatible wire format; non-default gateways are selected
    /// via `base_url`.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| WeirError::Auth {
            provider: config.engine.clone(),
        })?;

        let mut adapter = OpenAiCompatAdapter::new(api_key);
        if !config.engine.is_empty() {
            adapter = adapter.with_name(config.engine.clone());
        }
        if let Some(base_url) = &config.base_url {
            adapter = adapter.with_base_url(base_url.clone());
        }

        Ok(Self::new(DynProvider::new(adapter), config.model.clone()))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn request(
        &self,
        messages: Vec<ChatMessage>,
        extra: serde_json::Map<String, Value>,
    ) -> ChatRequest {
        let mut request = ChatRequest::new(self.model.clone(), messages);
        request.extra = extra;
        request
    }

    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        extra: serde_json::Map<String, Value>,
    ) -> Result<ChatResponse> {
        self.provider.complete(&self.request(messages, extra)).await
    }

    pub fn stream_generate(
        &self,
        messages: Vec<ChatMessage>,
        extra: serde_json::Map<String, Value>,
    ) -> DeltaStream<'_> {
        let request = self.request(messages, extra);
        let provider = &self.provider;
        Box::pin(async_stream::stream! {
            let mut inner = provider.stream(&request);
            while let Some(item) = tokio_stream::StreamExt::next(&mut inner).await {
                yield item;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assemble_from_object_api_info() {
        let api_info = json!({"api_key": "sk-123", "base_url": "https://gw.local"});
        let config =
            ClientConfig::assemble("openai", "gpt-4o", Some(&api_info), &serde_json::Map::new())
                .unwrap();

        assert_eq!(config.engine, "openai");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.api_key.as_deref(), Some("sk-123"));
        assert_eq!(config.base_url.as_deref(), Some("https://gw.local"));
        assert!(config.extra.is_empty());
    }

    #[test]
    fn assemble_from_json_string_api_info() {
        let api_info = json!("{\"private_key\": \"sk-abc\"}");
        let config =
            ClientConfig::assemble("openai", "m", Some(&api_info), &serde_json::Map::new())
                .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-abc"));
    }

    #[test]
    fn assemble_rejects_non_object_api_info() {
        let api_info = json!([1, 2]);
        let result =
            ClientConfig::assemble("openai", "m", Some(&api_info), &serde_json::Map::new());
        assert!(result.is_err());

        let api_info = json!("[1, 2]");
        let result =
            ClientConfig::assemble("openai", "m", Some(&api_info), &serde_json::Map::new());
        assert!(result.is_err());
    }

    #[test]
    fn assemble_keeps_unknown_keys_as_extra() {
        let api_info = json!({"api_key": "k", "organization": "org-1"});
        let mut extra_data = serde_json::Map::new();
        extra_data.insert("temperature".into(), json!(0.2));

        let config = ClientConfig::assemble("openai", "m", Some(&api_info), &extra_data).unwrap();
        assert_eq!(config.extra["organization"], "org-1");
        assert_eq!(config.extra["temperature"], 0.2);
    }

    #[test]
    fn config_round_trips_through_value() {
        let config = ClientConfig {
            engine: "openai".into(),
            model: "gpt-4o".into(),
            api_key: Some("sk".into()),
            base_url: None,
            extra: serde_json::Map::new(),
        };
        let value = config.to_value();
        let back: ClientConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.model, "gpt-4o");
        assert_eq!(back.api_key.as_deref(), Some("sk"));
    }

    #[test]
    fn from_config_requires_api_key() {
        let config = ClientConfig {
            engine: "openai".into(),
            model: "m".into(),
            ..Default::default()
        };
        let result = LlmClient::from_config(&config);
        assert!(matches!(result, Err(WeirError::Auth { .. })));
    }

    #[test]
    fn from_config_builds_named_client() {
        let config = ClientConfig {
            engine: "gateway".into(),
            model: "m".into(),
            api_key: Some("k".into()),
            base_url: Some("https://gw.local".into()),
            extra: serde_json::Map::new(),
        };
        let client = LlmClient::from_config(&config).unwrap();
        assert_eq!(client.provider_name(), "gateway");
        assert_eq!(client.model, "m");
    }
}

//! Debug configuration and presets.
//!
//! A config can come straight from the graph JSON's `debug_config` key,
//! optionally starting from a named preset with field-level overrides:
//!
//! ```json
//! { "preset": "production", "max_payload_length": 2000 }
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weir_types::{Result, WeirError};

use crate::events::{DebugEventKind, DebugSeverity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Master switch; a graph may carry `debug: true` with a disabled config.
    pub enabled: bool,

    // Filtering
    pub min_severity: DebugSeverity,
    pub include_event_kinds: Option<HashSet<DebugEventKind>>,
    pub exclude_event_kinds: HashSet<DebugEventKind>,
    pub include_nodes: Option<HashSet<String>>,
    pub exclude_nodes: HashSet<String>,

    // Redaction
    pub redact_sensitive: bool,
    pub additional_redact_keys: HashSet<String>,

    // Truncation
    pub max_payload_length: usize,
    pub max_list_items: usize,

    // Data capture
    pub capture_inputs: bool,
    pub capture_outputs: bool,
    pub capture_internal_state: bool,

    // Format
    pub use_legacy_format: bool,

    // Logging
    pub emit_to_log: bool,
    pub log_level: String,

    // Sampling
    pub sample_rate: f64,

    // Extra tags and metadata attached to all events
    pub default_tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: DebugSeverity::Debug,
            include_event_kinds: None,
            exclude_event_kinds: HashSet::new(),
            include_nodes: None,
            exclude_nodes: HashSet::new(),
            redact_sensitive: true,
            additional_redact_keys: HashSet::new(),
            max_payload_length: 1000,
            max_list_items: 20,
            capture_inputs: true,
            capture_outputs: true,
            capture_internal_state: true,
            use_legacy_format: true,
            emit_to_log: false,
            log_level: "debug".to_string(),
            sample_rate: 1.0,
            default_tags: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl DebugConfig {
    /// Errors and warnings only, no captured data.
    pub fn minimal() -> Self {
        Self {
            min_severity: DebugSeverity::Warn,
            capture_inputs: false,
            capture_outputs: false,
            capture_internal_state: false,
            max_payload_length: 200,
            ..Self::default()
        }
    }

    /// Everything including trace, with larger caps.
    pub fn verbose() -> Self {
        Self {
            min_severity: DebugSeverity::Trace,
            max_payload_length: 5000,
            max_list_items: 100,
            emit_to_log: true,
            ..Self::default()
        }
    }

    /// Production-safe: sampled, redacted, key lifecycle + errors only.
    pub fn production() -> Self {
        Self {
            min_severity: DebugSeverity::Info,
            sample_rate: 0.1,
            max_payload_length: 500,
            include_event_kinds: Some(HashSet::from([
                DebugEventKind::GraphStart,
                DebugEventKind::GraphEnd,
                DebugEventKind::NodeError,
                DebugEventKind::ValidationError,
                DebugEventKind::RoutingError,
            ])),
            ..Self::default()
        }
    }

    /// Only error events.
    pub fn errors_only() -> Self {
        Self {
            min_severity: DebugSeverity::Error,
            include_event_kinds: Some(HashSet::from([
                DebugEventKind::NodeError,
                DebugEventKind::ValidationError,
                DebugEventKind::RoutingError,
                DebugEventKind::TimeoutError,
                DebugEventKind::InputError,
                DebugEventKind::TemplateError,
                DebugEventKind::ParseError,
            ])),
            ..Self::default()
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::default()),
            "minimal" => Ok(Self::minimal()),
            "verbose" => Ok(Self::verbose()),
            "production" => Ok(Self::production()),
            "errors_only" => Ok(Self::errors_only()),
            other => Err(WeirError::Configuration {
                node: "debug_config".into(),
                message: format!(
                    "unknown preset '{other}'; available: default, minimal, verbose, production, errors_only"
                ),
            }),
        }
    }

    /// Build from the graph JSON's `debug_config` value: an optional
    /// `preset` name plus field overrides layered on top of it.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return if value.is_null() {
                Ok(Self::default())
            } else {
                Err(WeirError::Configuration {
                    node: "debug_config".into(),
                    message: "debug_config must be an object".into(),
                })
            };
        };

        let base = match map.get("preset").and_then(|v| v.as_str()) {
            Some(name) => Self::preset(name)?,
            None => Self::default(),
        };

        // Overlay the overrides on the preset's serialized form so partial
        // configs keep preset values for everything they do not mention.
        let mut merged = match serde_json::to_value(&base)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in map {
            if key != "preset" {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(serde_json::from_value(Value::Object(merged))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_values() {
        let config = DebugConfig::default();
        assert!(config.enabled);
        assert!(config.redact_sensitive);
        assert_eq!(config.max_payload_length, 1000);
        assert_eq!(config.max_list_items, 20);
        assert_eq!(config.sample_rate, 1.0);
        assert!(config.use_legacy_format);
    }

    #[test]
    fn minimal_preset_drops_data_capture() {
        let config = DebugConfig::minimal();
        assert_eq!(config.min_severity, DebugSeverity::Warn);
        assert!(!config.capture_inputs);
        assert!(!config.capture_outputs);
        assert_eq!(config.max_payload_length, 200);
    }

    #[test]
    fn production_preset_samples_and_filters() {
        let config = DebugConfig::production();
        assert_eq!(config.sample_rate, 0.1);
        let kinds = config.include_event_kinds.unwrap();
        assert!(kinds.contains(&DebugEventKind::NodeError));
        assert!(!kinds.contains(&DebugEventKind::NodeEnd));
    }

    #[test]
    fn unknown_preset_is_an_error() {
        assert!(DebugConfig::preset("chatty").is_err());
    }

    #[test]
    fn from_value_null_is_default() {
        let config = DebugConfig::from_value(&Value::Null).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn from_value_preset_with_overrides() {
        let config = DebugConfig::from_value(&json!({
            "preset": "verbose",
            "max_payload_length": 2000,
            "redact_sensitive": false
        }))
        .unwrap();

        // Preset values survive where not overridden.
        assert_eq!(config.min_severity, DebugSeverity::Trace);
        assert!(config.emit_to_log);
        // Overrides applied.
        assert_eq!(config.max_payload_length, 2000);
        assert!(!config.redact_sensitive);
    }

    #[test]
    fn from_value_plain_overrides() {
        let config = DebugConfig::from_value(&json!({
            "min_severity": "warn",
            "exclude_nodes": ["noisy_node"],
            "additional_redact_keys": ["session_cookie"]
        }))
        .unwrap();

        assert_eq!(config.min_severity, DebugSeverity::Warn);
        assert!(config.exclude_nodes.contains("noisy_node"));
        assert!(config.additional_redact_keys.contains("session_cookie"));
    }

    #[test]
    fn from_value_rejects_non_object() {
        assert!(DebugConfig::from_value(&json!("verbose")).is_err());
    }

    #[test]
    fn config_round_trips() {
        let config = DebugConfig::production();
        let value = serde_json::to_value(&config).unwrap();
        let back: DebugConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.sample_rate, config.sample_rate);
        assert_eq!(back.min_severity, config.min_severity);
    }
}

//! Event transformation pipeline.
//!
//! Transformers run in ascending `order`; any transformer may rewrite the
//! event or drop it (`None`), in which case no later transformer runs.
//! Design-level orders: redact 10, sample 15, filter 20, tag filter 25,
//! truncate 30, enrich 40.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::config::DebugConfig;
use crate::events::{DebugEvent, DebugEventKind, DebugSeverity};

// ---------------------------------------------------------------------------
// Transformer trait and pipeline
// ---------------------------------------------------------------------------

pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Ascending execution order. 0–9 pre-processing, 10–19 redaction,
    /// 20–29 filtering, 30–39 truncation, 40–49 enrichment.
    fn order(&self) -> i32;

    /// Rewrite the event, or return `None` to drop it.
    fn transform(&self, event: DebugEvent) -> Option<DebugEvent>;
}

#[derive(Default)]
pub struct TransformPipeline {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transformer: impl Transformer + 'static) -> &mut Self {
        self.transformers.push(Box::new(transformer));
        self.transformers.sort_by_key(|t| t.order());
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.transformers.retain(|t| t.name() != name);
        self
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn process(&self, event: DebugEvent) -> Option<DebugEvent> {
        let mut current = event;
        for transformer in &self.transformers {
            current = transformer.transform(current)?;
        }
        Some(current)
    }

    pub fn process_batch(&self, events: Vec<DebugEvent>) -> Vec<DebugEvent> {
        events
            .into_iter()
            .filter_map(|event| self.process(event))
            .collect()
    }

    /// The standard pipeline for a config: redact, sample, filter, tag
    /// filter, truncate, enrich — each stage only when the config asks.
    pub fn for_config(config: &DebugConfig) -> Self {
        let mut pipeline = Self::new();
        if config.redact_sensitive {
            pipeline.add(RedactTransformer::new(
                config.additional_redact_keys.clone(),
            ));
        }
        if config.sample_rate < 1.0 {
            pipeline.add(SamplingTransformer::new(config.sample_rate));
        }
        pipeline.add(FilterTransformer {
            include_kinds: config.include_event_kinds.clone(),
            exclude_kinds: config.exclude_event_kinds.clone(),
            min_severity: config.min_severity,
            include_nodes: config.include_nodes.clone(),
            exclude_nodes: config.exclude_nodes.clone(),
        });
        pipeline.add(TruncateTransformer::new(
            config.max_payload_length,
            config.max_list_items,
        ));
        if !config.default_tags.is_empty() || !config.metadata.is_empty() {
            pipeline.add(EnrichTransformer::new(
                config.metadata.clone(),
                config.default_tags.clone(),
            ));
        }
        pipeline
    }
}

// ---------------------------------------------------------------------------
// Redact
// ---------------------------------------------------------------------------

pub const REDACTION_MARKER: &str = "***REDACTED***";

const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "api-key",
    "private_key",
    "privatekey",
    "private-key",
    "authorization",
    "auth",
    "password",
    "passwd",
    "pwd",
    "token",
    "access_token",
    "refresh_token",
    "bearer",
    "secret",
    "credential",
    "credentials",
    "client_secret",
];

/// Replace values of sensitive keys with a marker, recursing into nested
/// maps and lists. Matching is a case-insensitive substring check.
pub struct RedactTransformer {
    sensitive: HashSet<String>,
    marker: String,
}

impl RedactTransformer {
    pub fn new(additional: HashSet<String>) -> Self {
        let mut sensitive: HashSet<String> =
            SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect();
        sensitive.extend(additional.into_iter().map(|k| k.to_lowercase()));
        Self {
            sensitive,
            marker: REDACTION_MARKER.to_string(),
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.sensitive.iter().any(|s| key.contains(s.as_str()))
    }

    fn redact_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(
                items.into_iter().map(|v| self.redact_value(v)).collect(),
            ),
            other => other,
        }
    }

    fn redact_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        map.into_iter()
            .map(|(key, value)| {
                if self.is_sensitive(&key) {
                    (key, Value::String(self.marker.clone()))
                } else {
                    (key, self.redact_value(value))
                }
            })
            .collect()
    }
}

impl Transformer for RedactTransformer {
    fn name(&self) -> &str {
        "redact"
    }

    fn order(&self) -> i32 {
        10
    }

    fn transform(&self, mut event: DebugEvent) -> Option<DebugEvent> {
        event.payload = self.redact_map(std::mem::take(&mut event.payload));
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Probabilistically drop events. Error kinds are never dropped.
pub struct SamplingTransformer {
    sample_rate: f64,
}

impl SamplingTransformer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }
}

impl Transformer for SamplingTransformer {
    fn name(&self) -> &str {
        "sampling"
    }

    fn order(&self) -> i32 {
        15
    }

    fn transform(&self, event: DebugEvent) -> Option<DebugEvent> {
        if event.kind.is_error() {
            return Some(event);
        }
        if rand::random::<f64>() <= self.sample_rate {
            Some(event)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Include/exclude by event kind, severity floor, and node sets.
#[derive(Default)]
pub struct FilterTransformer {
    pub include_kinds: Option<HashSet<DebugEventKind>>,
    pub exclude_kinds: HashSet<DebugEventKind>,
    pub min_severity: DebugSeverity,
    pub include_nodes: Option<HashSet<String>>,
    pub exclude_nodes: HashSet<String>,
}

impl Transformer for FilterTransformer {
    fn name(&self) -> &str {
        "filter"
    }

    fn order(&self) -> i32 {
        20
    }

    fn transform(&self, event: DebugEvent) -> Option<DebugEvent> {
        if let Some(include) = &self.include_kinds {
            if !include.contains(&event.kind) {
                return None;
            }
        }
        if self.exclude_kinds.contains(&event.kind) {
            return None;
        }
        if event.severity < self.min_severity {
            return None;
        }
        if let Some(node_id) = &event.node_id {
            if let Some(include) = &self.include_nodes {
                if !include.contains(node_id) {
                    return None;
                }
            }
            if self.exclude_nodes.contains(node_id) {
                return None;
            }
        }
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Tag filter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TagFilterTransformer {
    pub include_tags: Option<HashSet<String>>,
    pub exclude_tags: HashSet<String>,
    pub require_all: bool,
}

impl Transformer for TagFilterTransformer {
    fn name(&self) -> &str {
        "tag_filter"
    }

    fn order(&self) -> i32 {
        25
    }

    fn transform(&self, event: DebugEvent) -> Option<DebugEvent> {
        let tags: HashSet<&str> = event.tags.iter().map(String::as_str).collect();

        if self.exclude_tags.iter().any(|t| tags.contains(t.as_str())) {
            return None;
        }
        if let Some(include) = &self.include_tags {
            let matches = if self.require_all {
                include.iter().all(|t| tags.contains(t.as_str()))
            } else {
                include.iter().any(|t| tags.contains(t.as_str()))
            };
            if !matches {
                return None;
            }
        }
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Truncate
// ---------------------------------------------------------------------------

pub const TRUNCATION_SUFFIX: &str = "...[truncated]";

/// Cap strings at N characters and lists at M items, recursively.
pub struct TruncateTransformer {
    max_length: usize,
    max_list_items: usize,
}

impl TruncateTransformer {
    pub fn new(max_length: usize, max_list_items: usize) -> Self {
        Self {
            max_length,
            max_list_items,
        }
    }

    fn truncate_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) if s.chars().count() > self.max_length => {
                let kept: String = s.chars().take(self.max_length).collect();
                Value::String(format!("{kept}{TRUNCATION_SUFFIX}"))
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.truncate_value(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                let total = items.len();
                let mut kept: Vec<Value> = items
                    .into_iter()
                    .take(self.max_list_items)
                    .map(|v| self.truncate_value(v))
                    .collect();
                if total > self.max_list_items {
                    kept.push(Value::String(format!(
                        "...[{} more items]",
                        total - self.max_list_items
                    )));
                }
                Value::Array(kept)
            }
            other => other,
        }
    }
}

impl Transformer for TruncateTransformer {
    fn name(&self) -> &str {
        "truncate"
    }

    fn order(&self) -> i32 {
        30
    }

    fn transform(&self, mut event: DebugEvent) -> Option<DebugEvent> {
        event.payload = std::mem::take(&mut event.payload)
            .into_iter()
            .map(|(k, v)| (k, self.truncate_value(v)))
            .collect();
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Enrich
// ---------------------------------------------------------------------------

type ComputedField = Box<dyn Fn(&DebugEvent) -> Value + Send + Sync>;

/// Add static fields, computed fields, and tags to every event.
pub struct EnrichTransformer {
    static_fields: Map<String, Value>,
    computed_fields: Vec<(String, ComputedField)>,
    add_tags: Vec<String>,
}

impl EnrichTransformer {
    pub fn new(static_fields: Map<String, Value>, add_tags: Vec<String>) -> Self {
        Self {
            static_fields,
            computed_fields: Vec::new(),
            add_tags,
        }
    }

    pub fn with_computed(
        mut self,
        key: &str,
        compute: impl Fn(&DebugEvent) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.computed_fields.push((key.to_string(), Box::new(compute)));
        self
    }
}

impl Transformer for EnrichTransformer {
    fn name(&self) -> &str {
        "enrich"
    }

    fn order(&self) -> i32 {
        40
    }

    fn transform(&self, mut event: DebugEvent) -> Option<DebugEvent> {
        for (key, value) in &self.static_fields {
            event.payload.insert(key.clone(), value.clone());
        }
        let computed: Vec<(String, Value)> = self
            .computed_fields
            .iter()
            .map(|(key, compute)| (key.clone(), compute(&event)))
            .collect();
        for (key, value) in computed {
            event.payload.insert(key, value);
        }
        for tag in &self.add_tags {
            if !event.tags.contains(tag) {
                event.tags.push(tag.clone());
            }
        }
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

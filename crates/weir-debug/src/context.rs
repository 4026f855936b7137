//! Request-scoped debug context.
//!
//! Ties capture, transform, emit, and collect together for one execution.
//! The context is shared across node tasks behind an `Arc`; the disabled
//! context short-circuits every call before touching any stage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use weir_types::FlowEvent;

use crate::collector::{Collector, GraphExecutionSummary};
use crate::config::DebugConfig;
use crate::emitter::{EmitterRegistry, LogEmitter, QueueEmitter};
use crate::events::{
    self, DebugEvent, DebugEventKind, DebugSeverity,
};
use crate::transform::TransformPipeline;

pub struct DebugContext {
    enabled: bool,
    execution_id: String,
    graph_type: String,
    config: DebugConfig,
    pipeline: TransformPipeline,
    registry: EmitterRegistry,
    collector: Mutex<Option<Collector>>,
    sequence: AtomicU64,
}

impl DebugContext {
    /// A context that ignores every call. Used when debug is off so the hot
    /// path carries no conditional logic beyond the enabled check.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            execution_id: String::new(),
            graph_type: String::new(),
            config: DebugConfig {
                enabled: false,
                ..DebugConfig::default()
            },
            pipeline: TransformPipeline::new(),
            registry: EmitterRegistry::new(),
            collector: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn new(graph_type: &str, config: DebugConfig, total_nodes: usize) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        let pipeline = TransformPipeline::for_config(&config);
        let mut registry = EmitterRegistry::new();
        if config.emit_to_log {
            registry.register(LogEmitter::new(false));
        }
        let collector = Collector::new(&execution_id, graph_type, total_nodes);

        Self {
            enabled: true,
            execution_id,
            graph_type: graph_type.to_string(),
            config,
            pipeline,
            registry,
            collector: Mutex::new(Some(collector)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Wire the context's queue emitter to the caller's output stream.
    pub fn attach_stream(&mut self, sender: mpsc::Sender<FlowEvent>) {
        if self.enabled {
            let use_legacy = self.config.use_legacy_format;
            self.registry.register(QueueEmitter::new(sender, use_legacy));
        }
    }

    pub fn add_emitter(&mut self, emitter: impl crate::emitter::Emitter + 'static) {
        if self.enabled {
            self.registry.register(emitter);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn graph_type(&self) -> &str {
        &self.graph_type
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    /// Run one event through transform → emit → collect.
    pub async fn emit(&self, mut event: DebugEvent) {
        if !self.enabled {
            return;
        }
        event.execution_id = self.execution_id.clone();
        event.sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed);

        let Some(event) = self.pipeline.process(event) else {
            return;
        };
        self.registry.emit(&event).await;
        if let Ok(mut guard) = self.collector.lock() {
            if let Some(collector) = guard.as_mut() {
                collector.collect(&event);
            }
        }
    }

    pub async fn graph_start(&self, total_nodes: usize) {
        if !self.enabled {
            return;
        }
        self.emit(events::graph_start_event(&self.graph_type, total_nodes))
            .await;
    }

    pub async fn node_start(&self, node_id: &str, node_kind: &str, inputs: Value) {
        if !self.enabled {
            return;
        }
        let inputs = if self.config.capture_inputs {
            inputs
        } else {
            Value::Object(Map::new())
        };
        self.emit(events::node_start_event(node_id, node_kind, inputs))
            .await;
    }

    pub async fn node_end(
        &self,
        node_id: &str,
        node_kind: &str,
        outputs: Value,
        internal_state: Value,
        duration_ms: f64,
    ) {
        if !self.enabled {
            return;
        }
        let outputs = if self.config.capture_outputs {
            outputs
        } else {
            Value::Object(Map::new())
        };
        let internal_state = if self.config.capture_internal_state {
            internal_state
        } else {
            Value::Object(Map::new())
        };
        self.emit(events::node_end_event(
            node_id,
            node_kind,
            outputs,
            internal_state,
            duration_ms,
        ))
        .await;
    }

    pub async fn node_error(
        &self,
        node_id: &str,
        node_kind: &str,
        error_type: &str,
        message: &str,
        context: Value,
    ) {
        if !self.enabled {
            return;
        }
        self.emit(events::node_error_event(
            node_id, node_kind, error_type, message, context,
        ))
        .await;
    }

    pub async fn node_bypass(&self, node_id: &str, node_kind: &str, reason: &str) {
        if !self.enabled {
            return;
        }
        self.emit(events::node_bypass_event(node_id, node_kind, reason))
            .await;
    }

    pub async fn edge_traversed(
        &self,
        source: &str,
        source_handle: &str,
        target: &str,
        target_handle: &str,
    ) {
        if !self.enabled {
            return;
        }
        self.emit(events::edge_traversed_event(
            source,
            source_handle,
            target,
            target_handle,
        ))
        .await;
    }

    /// A free-form record yielded by a node on its debug kind. Records that
    /// carry an `error_type` become error events; everything else is a
    /// diagnostic.
    pub async fn node_record(&self, node_id: &str, node_kind: &str, record: Value) {
        if !self.enabled {
            return;
        }
        let error_type = record
            .get("error_type")
            .and_then(|v| v.as_str())
            .map(String::from);

        let mut event = match &error_type {
            Some(error_type) => DebugEvent::new(DebugEventKind::for_error(error_type)),
            None => DebugEvent::new(DebugEventKind::DataTransformed)
                .with_severity(DebugSeverity::Debug),
        };
        event = event.with_node(node_id, node_kind);
        if let Value::Object(map) = record {
            event.payload = map;
        } else {
            event.payload.insert("record".into(), record);
        }
        self.emit(event).await;
    }

    /// A validation diagnostic stored on the graph, surfaced before
    /// execution begins.
    pub async fn validation_issue(&self, record: Value) {
        if !self.enabled {
            return;
        }
        let error_type = record
            .get("error_type")
            .and_then(|v| v.as_str())
            .unwrap_or("GraphValidationError")
            .to_string();
        let severity = match record.get("severity").and_then(|v| v.as_str()) {
            Some("warning") => DebugSeverity::Warn,
            _ => DebugSeverity::Error,
        };
        let mut event =
            DebugEvent::new(DebugEventKind::for_error(&error_type)).with_severity(severity);
        if let Value::Object(map) = record {
            event.payload = map;
        }
        self.emit(event).await;
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Emit the graph-end event, flush and close emitters, and return the
    /// aggregated summary. Returns `None` when disabled or already finished.
    pub async fn finish(&self) -> Option<GraphExecutionSummary> {
        if !self.enabled {
            return None;
        }

        let (total, executed, bypassed, failed, start_time) = {
            let guard = self.collector.lock().ok()?;
            let collector = guard.as_ref()?;
            collector.snapshot_counts()
        };
        let total_duration_ms = start_time
            .map(|start| {
                (chrono::Utc::now() - start).num_microseconds().unwrap_or(0) as f64 / 1000.0
            })
            .unwrap_or(0.0);

        self.emit(events::graph_end_event(
            total,
            executed,
            bypassed,
            failed,
            total_duration_ms,
        ))
        .await;

        self.registry.flush_all().await;
        self.registry.close_all().await;

        let collector = self.collector.lock().ok()?.take()?;
        Some(collector.finalize())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_with_stream() -> (DebugContext, mpsc::Receiver<FlowEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let mut ctx = DebugContext::new("chat", DebugConfig::default(), 2);
        ctx.attach_stream(tx);
        (ctx, rx)
    }

    #[tokio::test]
    async fn disabled_context_is_silent() {
        let ctx = DebugContext::disabled();
        assert!(!ctx.enabled());
        ctx.node_start("a", "text", json!({})).await;
        ctx.node_end("a", "text", json!({}), json!({}), 1.0).await;
        assert!(ctx.finish().await.is_none());
    }

    #[tokio::test]
    async fn disabled_config_yields_disabled_context() {
        let config = DebugConfig {
            enabled: false,
            ..DebugConfig::default()
        };
        let ctx = DebugContext::new("chat", config, 1);
        assert!(!ctx.enabled());
    }

    #[tokio::test]
    async fn events_reach_the_stream_and_summary() {
        let (ctx, mut rx) = context_with_stream();

        ctx.graph_start(2).await;
        ctx.node_start("a", "text", json!({"in": 1})).await;
        ctx.node_end("a", "text", json!({"out": 2}), json!({}), 3.0)
            .await;
        ctx.node_bypass("b", "text", "not selected").await;

        let summary = ctx.finish().await.unwrap();
        assert_eq!(summary.executed_nodes, 1);
        assert_eq!(summary.bypassed_nodes, 1);
        assert_eq!(summary.total_nodes, 2);

        // Stream carried one debug record per event (graph start, node
        // start/end, bypass, graph end).
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.is_debug());
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = DebugConfig {
            use_legacy_format: false,
            ..DebugConfig::default()
        };
        let mut ctx = DebugContext::new("chat", config, 2);
        ctx.attach_stream(tx);

        ctx.node_start("a", "text", json!({})).await;
        ctx.node_start("b", "text", json!({})).await;
        drop(ctx);

        let seq = |event: &FlowEvent| match event {
            FlowEvent::Debug { content, .. } => content["sequence_number"].as_u64().unwrap(),
            _ => panic!("expected debug record"),
        };
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(seq(&second) > seq(&first));
    }

    #[tokio::test]
    async fn node_record_classifies_errors() {
        let (ctx, mut rx) = context_with_stream();
        ctx.node_record(
            "c",
            "conditional",
            json!({"error_type": "TemplateError", "error_message": "bad"}),
        )
        .await;

        match rx.recv().await.unwrap() {
            FlowEvent::Debug { event_type, .. } => {
                assert_eq!(event_type.as_deref(), Some("template_error"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let summary = ctx.finish().await.unwrap();
        assert_eq!(summary.failed_nodes, 1);
    }

    #[tokio::test]
    async fn validation_issue_severity_mapping() {
        let (ctx, mut rx) = context_with_stream();
        ctx.validation_issue(json!({
            "error_type": "SelfLoopEdge",
            "severity": "warning",
            "error_message": "edge loops on node 'a'"
        }))
        .await;

        match rx.recv().await.unwrap() {
            FlowEvent::Debug { content, .. } => {
                assert_eq!(content["error_message"], "edge loops on node 'a'");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_flags_strip_data() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = DebugConfig {
            capture_inputs: false,
            capture_outputs: false,
            ..DebugConfig::default()
        };
        let mut ctx = DebugContext::new("chat", config, 1);
        ctx.attach_stream(tx);

        ctx.node_start("a", "text", json!({"secretless": 1})).await;
        ctx.node_end("a", "text", json!({"big": 2}), json!({}), 0.1)
            .await;

        match rx.recv().await.unwrap() {
            FlowEvent::Debug { content, .. } => {
                assert_eq!(content["inputs"], json!({}));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            FlowEvent::Debug { content, .. } => {
                assert_eq!(content["outputs"], json!({}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (ctx, _rx) = context_with_stream();
        assert!(ctx.finish().await.is_some());
        assert!(ctx.finish().await.is_none());
    }
}

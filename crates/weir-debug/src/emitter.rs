//! Event emission layer.
//!
//! Emitters deliver transformed events to their destinations. The registry
//! fans out to all registered emitters concurrently; one emitter failing
//! never stalls the pipeline or the others.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;

use weir_types::{FlowEvent, Result, WeirError};

use crate::events::{DebugEvent, DebugSeverity};
use crate::transform::TransformPipeline;

// ---------------------------------------------------------------------------
// Emitter trait and registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Emitter: Send + Sync {
    fn name(&self) -> &str;

    async fn emit(&self, event: &DebugEvent) -> Result<()>;

    async fn emit_batch(&self, events: &[DebugEvent]) -> Result<()> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Append-only set of emitters. `emit` delivers to all of them in parallel
/// and swallows individual failures after logging them.
#[derive(Default)]
pub struct EmitterRegistry {
    emitters: Vec<Box<dyn Emitter>>,
}

impl EmitterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, emitter: impl Emitter + 'static) -> &mut Self {
        self.emitters.push(Box::new(emitter));
        self
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }

    pub async fn emit(&self, event: &DebugEvent) {
        if self.emitters.is_empty() {
            return;
        }
        let results = join_all(self.emitters.iter().map(|e| e.emit(event))).await;
        for (emitter, result) in self.emitters.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(emitter = emitter.name(), error = %err, "emitter failed");
            }
        }
    }

    pub async fn emit_batch(&self, events: &[DebugEvent]) {
        if self.emitters.is_empty() || events.is_empty() {
            return;
        }
        let results = join_all(self.emitters.iter().map(|e| e.emit_batch(events))).await;
        for (emitter, result) in self.emitters.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(emitter = emitter.name(), error = %err, "emitter batch failed");
            }
        }
    }

    pub async fn flush_all(&self) {
        let _ = join_all(self.emitters.iter().map(|e| e.flush())).await;
    }

    pub async fn close_all(&self) {
        let _ = join_all(self.emitters.iter().map(|e| e.close())).await;
    }
}

// ---------------------------------------------------------------------------
// QueueEmitter — delivers onto the caller's output stream
// ---------------------------------------------------------------------------

/// The primary emitter: events become `debug` records on the user-facing
/// stream, in either the legacy flat form or the structured form.
pub struct QueueEmitter {
    sender: mpsc::Sender<FlowEvent>,
    use_legacy_format: bool,
    include_event_type: bool,
    closed: AtomicBool,
}

impl QueueEmitter {
    pub fn new(sender: mpsc::Sender<FlowEvent>, use_legacy_format: bool) -> Self {
        Self {
            sender,
            use_legacy_format,
            include_event_type: true,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Emitter for QueueEmitter {
    fn name(&self) -> &str {
        "queue"
    }

    async fn emit(&self, event: &DebugEvent) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let content = if self.use_legacy_format {
            event.to_legacy()
        } else {
            event.to_value()
        };
        let record = FlowEvent::Debug {
            content,
            event_type: self
                .include_event_type
                .then(|| event.kind.as_str().to_string()),
        };
        self.sender
            .send(record)
            .await
            .map_err(|_| WeirError::Other("debug output stream closed".into()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogEmitter — severity-mapped tracing output
// ---------------------------------------------------------------------------

pub struct LogEmitter {
    format_json: bool,
}

impl LogEmitter {
    pub fn new(format_json: bool) -> Self {
        Self { format_json }
    }

    fn format_event(event: &DebugEvent) -> String {
        let mut parts = vec![format!("[{}]", event.kind.as_str())];
        if let Some(node_id) = &event.node_id {
            parts.push(format!("node={node_id}"));
        }
        if let Some(duration) = event.payload.get("duration_ms").and_then(|v| v.as_f64()) {
            parts.push(format!("duration={duration:.2}ms"));
        }
        if let Some(message) = event.payload.get("error_message").and_then(|v| v.as_str()) {
            parts.push(format!("error={message}"));
        }
        parts.join(" ")
    }
}

#[async_trait]
impl Emitter for LogEmitter {
    fn name(&self) -> &str {
        "log"
    }

    async fn emit(&self, event: &DebugEvent) -> Result<()> {
        let message = if self.format_json {
            event.to_value().to_string()
        } else {
            Self::format_event(event)
        };
        match event.severity {
            DebugSeverity::Trace => tracing::trace!(target: "weir::debug", "{message}"),
            DebugSeverity::Debug => tracing::debug!(target: "weir::debug", "{message}"),
            DebugSeverity::Info => tracing::info!(target: "weir::debug", "{message}"),
            DebugSeverity::Warn => tracing::warn!(target: "weir::debug", "{message}"),
            DebugSeverity::Error => tracing::error!(target: "weir::debug", "{message}"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CallbackEmitter — user-supplied hooks
// ---------------------------------------------------------------------------

type SyncCallback = Box<dyn Fn(&DebugEvent) + Send + Sync>;
type AsyncCallback =
    Box<dyn Fn(DebugEvent) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct CallbackEmitter {
    sync_callbacks: Vec<SyncCallback>,
    async_callbacks: Vec<AsyncCallback>,
}

impl CallbackEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync(mut self, callback: impl Fn(&DebugEvent) + Send + Sync + 'static) -> Self {
        self.sync_callbacks.push(Box::new(callback));
        self
    }

    pub fn with_async<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(DebugEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.async_callbacks
            .push(Box::new(move |event| Box::pin(callback(event))));
        self
    }
}

#[async_trait]
impl Emitter for CallbackEmitter {
    fn name(&self) -> &str {
        "callback"
    }

    async fn emit(&self, event: &DebugEvent) -> Result<()> {
        for callback in &self.sync_callbacks {
            callback(event);
        }
        join_all(
            self.async_callbacks
                .iter()
                .map(|callback| callback(event.clone())),
        )
        .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BufferedEmitter — batches with size + time triggers
// ---------------------------------------------------------------------------

pub struct BufferedEmitter {
    inner: Box<dyn Emitter>,
    buffer: tokio::sync::Mutex<Vec<DebugEvent>>,
    buffer_size: usize,
    flush_interval: Option<Duration>,
    last_flush: tokio::sync::Mutex<Instant>,
    name: String,
}

impl BufferedEmitter {
    pub fn new(inner: impl Emitter + 'static, buffer_size: usize) -> Self {
        let name = format!("buffered_{}", inner.name());
        Self {
            inner: Box::new(inner),
            buffer: tokio::sync::Mutex::new(Vec::new()),
            buffer_size,
            flush_interval: None,
            last_flush: tokio::sync::Mutex::new(Instant::now()),
            name,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    async fn interval_elapsed(&self) -> bool {
        match self.flush_interval {
            Some(interval) => self.last_flush.lock().await.elapsed() >= interval,
            None => false,
        }
    }
}

#[async_trait]
impl Emitter for BufferedEmitter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, event: &DebugEvent) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event.clone());
            buffer.len() >= self.buffer_size
        };
        if should_flush || self.interval_elapsed().await {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        *self.last_flush.lock().await = Instant::now();
        if events.is_empty() {
            return Ok(());
        }
        self.inner.emit_batch(&events).await?;
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.flush().await?;
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// FilteredEmitter — wraps an emitter with its own transform pipeline
// ---------------------------------------------------------------------------

pub struct FilteredEmitter {
    inner: Box<dyn Emitter>,
    pipeline: TransformPipeline,
    name: String,
}

impl FilteredEmitter {
    pub fn new(inner: impl Emitter + 'static, pipeline: TransformPipeline) -> Self {
        let name = format!("filtered_{}", inner.name());
        Self {
            inner: Box::new(inner),
            pipeline,
            name,
        }
    }
}

#[async_trait]
impl Emitter for FilteredEmitter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, event: &DebugEvent) -> Result<()> {
        if let Some(transformed) = self.pipeline.process(event.clone()) {
            self.inner.emit(&transformed).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// NullEmitter
// ---------------------------------------------------------------------------

/// Discards all events.
pub struct NullEmitter;

#[async_trait]
impl Emitter for NullEmitter {
    fn name(&self) -> &str {
        "null"
    }

    async fn emit(&self, _event: &DebugEvent) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{node_error_event, DebugEvent, DebugEventKind};
    use crate::transform::FilterTransformer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingEmitter {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Emitter for CountingEmitter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn emit(&self, _event: &DebugEvent) -> Result<()> {
            if self.fail {
                return Err(WeirError::Other("boom".into()));
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(fail: bool) -> (CountingEmitter, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            CountingEmitter {
                count: count.clone(),
                fail,
            },
            count,
        )
    }

    #[tokio::test]
    async fn registry_fans_out_and_isolates_failures() {
        let (ok_emitter, count) = counting(false);
        let (bad_emitter, _) = counting(true);

        let mut registry = EmitterRegistry::new();
        registry.register(bad_emitter);
        registry.register(ok_emitter);

        registry.emit(&DebugEvent::new(DebugEventKind::NodeEnd)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_emitter_legacy_format() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = QueueEmitter::new(tx, true);

        let event = node_error_event("n1", "loop", "TimeoutError", "slow", serde_json::json!({}));
        emitter.emit(&event).await.unwrap();

        match rx.recv().await.unwrap() {
            FlowEvent::Debug {
                content,
                event_type,
            } => {
                assert_eq!(content["node_id"], "n1");
                assert_eq!(content["error_type"], "TimeoutError");
                assert_eq!(event_type.as_deref(), Some("timeout_error"));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_emitter_structured_format() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = QueueEmitter::new(tx, false);
        emitter
            .emit(&DebugEvent::new(DebugEventKind::NodeStart))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            FlowEvent::Debug { content, .. } => {
                assert_eq!(content["event_type"], "node_start");
                assert!(content["event_id"].is_string());
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_emitter_drops_after_close() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = QueueEmitter::new(tx, true);
        emitter.close().await.unwrap();
        emitter
            .emit(&DebugEvent::new(DebugEventKind::NodeStart))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn callback_emitter_calls_both_kinds() {
        let sync_count = Arc::new(AtomicUsize::new(0));
        let async_count = Arc::new(AtomicUsize::new(0));
        let sc = sync_count.clone();
        let ac = async_count.clone();

        let emitter = CallbackEmitter::new()
            .with_sync(move |_| {
                sc.fetch_add(1, Ordering::SeqCst);
            })
            .with_async(move |_event| {
                let ac = ac.clone();
                async move {
                    ac.fetch_add(1, Ordering::SeqCst);
                }
            });

        emitter
            .emit(&DebugEvent::new(DebugEventKind::NodeEnd))
            .await
            .unwrap();
        assert_eq!(sync_count.load(Ordering::SeqCst), 1);
        assert_eq!(async_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn buffered_emitter_flushes_on_size() {
        let (inner, count) = counting(false);
        let buffered = BufferedEmitter::new(inner, 3);

        for _ in 0..2 {
            buffered
                .emit(&DebugEvent::new(DebugEventKind::NodeEnd))
                .await
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0, "below the size trigger");

        buffered
            .emit(&DebugEvent::new(DebugEventKind::NodeEnd))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn buffered_emitter_close_flushes_remainder() {
        let (inner, count) = counting(false);
        let buffered = BufferedEmitter::new(inner, 100);
        buffered
            .emit(&DebugEvent::new(DebugEventKind::NodeEnd))
            .await
            .unwrap();
        buffered.close().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filtered_emitter_applies_pipeline() {
        let (inner, count) = counting(false);
        let mut pipeline = TransformPipeline::new();
        pipeline.add(FilterTransformer {
            min_severity: DebugSeverity::Error,
            ..Default::default()
        });
        let filtered = FilteredEmitter::new(inner, pipeline);

        filtered
            .emit(&DebugEvent::new(DebugEventKind::NodeStart))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        filtered
            .emit(&DebugEvent::new(DebugEventKind::NodeError))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_emitter_discards() {
        let emitter = NullEmitter;
        assert_eq!(emitter.name(), "null");
        emitter
            .emit(&DebugEvent::new(DebugEventKind::NodeEnd))
            .await
            .unwrap();
    }
}

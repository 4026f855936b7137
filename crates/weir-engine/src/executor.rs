//! The reactive executor.
//!
//! One task per node: each waits on its input tracker, executes when every
//! expected input is received or bypassed, and routes its outputs through
//! the dispatcher. A single bounded channel carries streaming content,
//! debug records, loop progress, and the final summary back to the caller;
//! it closes when the driver task (which joins all node tasks) drops the
//! last sender.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_core::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use weir_debug::{DebugConfig, DebugContext};
use weir_types::{
    is_system_signal, Envelope, FlowEvent, NodeKind, RunLog, EVENT_CONTENT, EVENT_DEBUG,
    SIGNAL_BYPASS_ALL,
};

use crate::config::ExecutorConfig;
use crate::dispatcher::{EventDispatcher, NodeState};
use crate::graph::FlowGraph;
use crate::loop_exec;

pub type FlowEventStream = Pin<Box<dyn Stream<Item = FlowEvent> + Send>>;

/// Size of the user-facing output channel; publishers await when full.
const OUTPUT_CAPACITY: usize = 256;

/// Execute a built graph, yielding the output stream.
///
/// Graphs containing a loop node are delegated to the loop sub-executor;
/// everything else runs reactively.
pub fn execute_graph(graph: FlowGraph, run: RunLog, config: ExecutorConfig) -> FlowEventStream {
    Box::pin(stream! {
        let mut run = run;
        if run.id_chat.is_none() {
            run.id_chat = Some(uuid::Uuid::new_v4().simple().to_string());
        }
        if run.id_thread.is_none() {
            run.id_thread = Some(uuid::Uuid::new_v4().simple().to_string());
        }

        let (tx, mut rx) = mpsc::channel::<FlowEvent>(OUTPUT_CAPACITY);
        let ctx = Arc::new(debug_context(&graph, tx.clone()));

        // Stored validation diagnostics surface before anything runs.
        for diagnostic in &graph.diagnostics {
            ctx.validation_issue(diagnostic.to_record()).await;
        }
        // The synthetic terminal is bookkeeping, not part of the user graph.
        ctx.graph_start(graph.nodes.len().saturating_sub(1)).await;

        if graph.has_loop() {
            tracing::info!("loop node detected; delegating to loop executor");
            tokio::spawn(async move {
                loop_exec::run_loop_graph(&graph, &run, &config, &ctx, &tx).await;
                finish_stream(&ctx, &tx).await;
            });
        } else {
            tracing::info!(
                nodes = graph.nodes.len(),
                edges = graph.edges.len(),
                "starting reactive execution"
            );
            let dispatcher = Arc::new(EventDispatcher::new(&graph, &config));
            let run = Arc::new(run);
            let mut tasks = JoinSet::new();
            for node_id in graph.nodes.keys().cloned() {
                let kind = graph.kind(&node_id).unwrap_or(NodeKind::Void);
                tasks.spawn(run_node(
                    node_id,
                    kind,
                    dispatcher.clone(),
                    ctx.clone(),
                    tx.clone(),
                    run.clone(),
                    config.input_timeout,
                ));
            }
            tokio::spawn(async move {
                while tasks.join_next().await.is_some() {}
                let (completed, bypassed, errors) = dispatcher.summary();
                tracing::info!(completed, bypassed, errors, "execution complete");
                finish_stream(&ctx, &tx).await;
            });
        }

        // Drain until every sender (node tasks, driver, debug emitter) is
        // gone. Completion and failure both end here.
        while let Some(event) = rx.recv().await {
            yield event;
        }
        tracing::info!("finished execution stream");
    })
}

fn debug_context(graph: &FlowGraph, tx: mpsc::Sender<FlowEvent>) -> DebugContext {
    if !graph.debug {
        return DebugContext::disabled();
    }
    let config = match &graph.debug_config {
        Some(value) => DebugConfig::from_value(value).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "invalid debug_config, using defaults");
            DebugConfig::default()
        }),
        None => DebugConfig::default(),
    };
    let mut ctx = DebugContext::new(
        &graph.graph_type,
        config,
        graph.nodes.len().saturating_sub(1),
    );
    ctx.attach_stream(tx);
    ctx
}

/// Emit the final summary (after the graph-end debug record) and release
/// the emitters. Shared by the reactive and loop paths.
pub(crate) async fn finish_stream(ctx: &Arc<DebugContext>, tx: &mpsc::Sender<FlowEvent>) {
    let use_legacy = ctx.config().use_legacy_format;
    if let Some(summary) = ctx.finish().await {
        let content = if use_legacy {
            summary.to_legacy()
        } else {
            summary.to_value()
        };
        let _ = tx.send(FlowEvent::DebugSummary { content }).await;
    }
}

// ---------------------------------------------------------------------------
// Per-node task
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_node(
    node_id: String,
    kind: NodeKind,
    dispatcher: Arc<EventDispatcher>,
    ctx: Arc<DebugContext>,
    tx: mpsc::Sender<FlowEvent>,
    run: Arc<RunLog>,
    input_timeout: Duration,
) {
    let Some(tracker) = dispatcher.tracker(&node_id) else {
        tracing::error!(node = %node_id, "no tracker for node");
        return;
    };
    let Some(node_arc) = dispatcher.node(&node_id).cloned() else {
        return;
    };
    let kind_str = kind.as_str();
    // The synthetic terminal stays out of the debug record.
    let visible = kind != NodeKind::Void;

    let should_execute = match tracker.wait_ready(input_timeout).await {
        Ok(should_execute) => should_execute,
        Err(err) => {
            dispatcher.set_state(&node_id, NodeState::Error);
            tracing::error!(node = %node_id, "node timed out waiting for inputs");
            if visible {
                ctx.node_error(
                    &node_id,
                    kind_str,
                    "TimeoutError",
                    &err.to_string(),
                    json!({"pending_handles": tracker.pending_handles().await}),
                )
                .await;
            }
            dispatcher.handle_bypass_all(&node_id).await;
            return;
        }
    };

    if !should_execute {
        dispatcher.set_state(&node_id, NodeState::Bypassed);
        node_arc.lock().await.core_mut().mark_bypassed();
        tracing::debug!(node = %node_id, "node bypassed");
        if visible {
            ctx.node_bypass(&node_id, kind_str, "all expected inputs bypassed")
                .await;
        }
        // Downstream handles fed by this node will never fire.
        dispatcher
            .propagate_untriggered(&node_id, &HashMap::new())
            .await;
        return;
    }

    let _permit = dispatcher.acquire_slot().await;
    dispatcher.set_state(&node_id, NodeState::Executing);
    tracing::debug!(node = %node_id, kind = kind_str, "executing node");

    let mut node = node_arc.lock().await;
    if visible {
        let inputs = serde_json::to_value(&node.core().inputs).unwrap_or(Value::Null);
        ctx.node_start(&node_id, kind_str, inputs).await;
    }
    let started = Instant::now();

    let mut staged: HashMap<String, Envelope> = HashMap::new();
    let mut selected: Option<String> = None;
    let mut bypass_all = false;
    {
        let mut events = node.call(&run);
        while let Some(event) = events.next().await {
            if event.kind == EVENT_CONTENT {
                // Streaming chunks flush immediately, even while other
                // nodes are still running.
                let _ = tx
                    .send(FlowEvent::content(event.content, Some(node_id.clone())))
                    .await;
            } else if event.kind == EVENT_DEBUG {
                ctx.node_record(&node_id, kind_str, event.content).await;
            } else if is_system_signal(&event.kind) {
                tracing::debug!(node = %node_id, signal = %event.kind, "system signal");
                if event.kind == SIGNAL_BYPASS_ALL {
                    bypass_all = true;
                }
            } else {
                if kind == NodeKind::Conditional && selected.is_none() {
                    selected = Some(event.kind.clone());
                }
                let envelope = serde_json::from_value::<Envelope>(event.content.clone())
                    .unwrap_or_else(|_| Envelope::new(kind_str, event.content));
                staged.insert(event.kind, envelope);
            }
        }
    }

    for (handle, envelope) in &staged {
        node.core_mut()
            .outputs
            .insert(handle.clone(), envelope.clone());
    }
    node.core_mut().mark_executed();
    let internal_state = node.internal_state();
    let node_selected = node.selected_handle().map(String::from);
    let default_handle = node.default_handle().map(String::from);
    drop(node);

    dispatcher.set_state(&node_id, NodeState::Completed);
    if visible {
        let outputs_json: Value = staged
            .iter()
            .map(|(handle, envelope)| (handle.clone(), envelope.to_value()))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        ctx.node_end(
            &node_id,
            kind_str,
            outputs_json,
            internal_state,
            started.elapsed().as_secs_f64() * 1000.0,
        )
        .await;
        for edge in dispatcher.outgoing(&node_id) {
            if staged.contains_key(&edge.source_handle) {
                ctx.edge_traversed(&node_id, &edge.source_handle, &edge.target, &edge.target_handle)
                    .await;
            }
        }
    }

    dispatcher.propagate_outputs(&node_id, &staged).await;

    if kind != NodeKind::Conditional {
        // Edges on handles this node never produced will not fire.
        dispatcher.propagate_untriggered(&node_id, &staged).await;
        return;
    }

    if bypass_all {
        dispatcher.handle_bypass_all(&node_id).await;
        return;
    }
    let Some(mut selected) = selected.or(node_selected) else {
        // Produced nothing and signaled nothing: no branch can fire.
        dispatcher.handle_bypass_all(&node_id).await;
        return;
    };
    if !dispatcher.has_outgoing_handle(&node_id, &selected) {
        let fallback =
            default_handle.filter(|handle| dispatcher.has_outgoing_handle(&node_id, handle));
        match fallback {
            Some(default) => {
                tracing::warn!(
                    node = %node_id,
                    selected = %selected,
                    default = %default,
                    "no edge for selected handle, using default"
                );
                // Route the rendered context along the default handle.
                if let Some(envelope) = staged.get(&selected) {
                    let mut rerouted = HashMap::new();
                    rerouted.insert(default.clone(), envelope.clone());
                    dispatcher.propagate_outputs(&node_id, &rerouted).await;
                }
                selected = default;
            }
            None => {
                let outgoing: Vec<&str> = dispatcher
                    .outgoing(&node_id)
                    .iter()
                    .map(|edge| edge.source_handle.as_str())
                    .collect();
                ctx.node_error(
                    &node_id,
                    kind_str,
                    "GraphRoutingError",
                    &format!(
                        "conditional selected handle '{selected}', but no outgoing edge matches"
                    ),
                    json!({
                        "selected_handle": selected,
                        "outgoing_handles": outgoing,
                    }),
                )
                .await;
                dispatcher.handle_bypass_all(&node_id).await;
                return;
            }
        }
    }
    dispatcher
        .propagate_conditional_bypass(&node_id, &selected)
        .await;
}

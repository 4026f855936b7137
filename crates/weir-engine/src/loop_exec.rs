//! The loop sub-executor.
//!
//! Graphs containing a loop node run in four phases: edge classification,
//! a sequential static phase that assembles the loop's list input, the
//! iteration phase (reset, item emission, topological walk, feedback
//! collection), and a sequential post-loop phase over everything fed by the
//! loop's `end` output. Iterations run one at a time; per-iteration
//! feedback is read only after every node in the iteration subgraph has
//! completed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use weir_debug::{DebugContext, DebugEvent, DebugEventKind};
use weir_nodes::{LoopHandles, LoopNode};
use weir_types::{
    is_system_signal, unwrap_envelope, Envelope, FlowEvent, LoopProgress, NodeKind, RunLog,
    EVENT_CONTENT, EVENT_DEBUG,
};

use crate::config::ExecutorConfig;
use crate::graph::{Edge, FlowGraph};

// ---------------------------------------------------------------------------
// Edge classification
// ---------------------------------------------------------------------------

struct LoopEdges {
    item: Vec<Edge>,
    feedback: Vec<Edge>,
    end: Vec<Edge>,
    static_: Vec<Edge>,
}

fn classify_edges(edges: &[Edge], loop_id: &str, handles: &LoopHandles) -> LoopEdges {
    let mut item = Vec::new();
    let mut feedback = Vec::new();
    let mut end = Vec::new();
    let mut static_ = Vec::new();

    for edge in edges {
        if edge.source == loop_id && edge.source_handle == handles.item {
            item.push(edge.clone());
        } else if edge.target == loop_id && edge.target_handle == handles.feedback {
            feedback.push(edge.clone());
        } else if edge.source == loop_id && edge.source_handle == handles.end {
            end.push(edge.clone());
        } else {
            static_.push(edge.clone());
        }
    }

    LoopEdges {
        item,
        feedback,
        end,
        static_,
    }
}

/// Nodes reachable from the loop's `item` output, stopping at the loop
/// node, its feedback edges, and its `end` output.
fn find_iteration_subgraph(
    loop_id: &str,
    handles: &LoopHandles,
    edges: &[Edge],
) -> HashSet<String> {
    let mut subgraph = HashSet::new();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<String> = edges
        .iter()
        .filter(|e| e.source == loop_id && e.source_handle == handles.item)
        .map(|e| e.target.clone())
        .collect();

    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id.clone()) {
            continue;
        }
        if node_id == loop_id {
            continue;
        }
        subgraph.insert(node_id.clone());

        for edge in edges.iter().filter(|e| e.source == node_id) {
            // Stop at the feedback edge and at the loop's end output.
            if edge.target == loop_id && edge.target_handle == handles.feedback {
                continue;
            }
            if edge.source == loop_id && edge.source_handle == handles.end {
                continue;
            }
            if !visited.contains(&edge.target) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    subgraph
}

/// Kahn's algorithm over the given node set and edges. Unplaced nodes
/// (cycles) are appended in discovery order with a warning; the executor
/// never refuses to run.
fn kahn_order(nodes: &HashSet<String>, edges: &[Edge]) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges {
        if nodes.contains(&edge.source) && nodes.contains(&edge.target) {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
            if let Some(count) = in_degree.get_mut(edge.target.as_str()) {
                *count += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = {
        let mut roots: Vec<&str> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        roots.sort_unstable();
        roots.into()
    };

    let mut order: Vec<String> = Vec::new();
    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        for neighbor in adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = in_degree.get_mut(neighbor) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        tracing::warn!(
            placed = order.len(),
            total = nodes.len(),
            "topological sort incomplete, appending remaining nodes"
        );
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut remaining: Vec<&String> =
            nodes.iter().filter(|n| !placed.contains(n.as_str())).collect();
        remaining.sort_unstable();
        order.extend(remaining.into_iter().cloned());
    }
    order
}

// ---------------------------------------------------------------------------
// Inline node execution
// ---------------------------------------------------------------------------

/// Copy already-produced outputs across the given edges into a target.
async fn apply_inputs(graph: &FlowGraph, node_id: &str, edges: &[Edge]) {
    for edge in edges.iter().filter(|e| e.target == node_id) {
        if edge.source == edge.target {
            continue;
        }
        let Some(source) = graph.node(&edge.source) else {
            continue;
        };
        let outputs = source.lock().await.core().outputs.clone();
        if outputs.contains_key(&edge.source_handle) {
            if let Some(target) = graph.node(node_id) {
                target
                    .lock()
                    .await
                    .core_mut()
                    .add_parent(&outputs, &edge.source_handle, &edge.target_handle);
            }
        }
    }
}

/// Execute a node in place if it has not run yet, draining its event
/// stream: streaming content and debug records go straight to the output
/// stream, everything else lands in the node's outputs.
async fn exec_node_inline(
    graph: &FlowGraph,
    node_id: &str,
    run: &RunLog,
    ctx: &Arc<DebugContext>,
    tx: &mpsc::Sender<FlowEvent>,
) {
    let Some(node_arc) = graph.node(node_id) else {
        return;
    };
    let mut node = node_arc.lock().await;
    if node.core().was_executed() {
        return;
    }
    let kind = node.kind();
    let kind_str = kind.as_str();
    let visible = kind != NodeKind::Void;

    if visible {
        let inputs = serde_json::to_value(&node.core().inputs).unwrap_or(Value::Null);
        ctx.node_start(node_id, kind_str, inputs).await;
    }
    let started = Instant::now();
    tracing::debug!(node = %node_id, kind = kind_str, "executing loop-graph node");

    let mut staged: HashMap<String, Envelope> = HashMap::new();
    {
        let mut events = node.call(run);
        while let Some(event) = events.next().await {
            if event.kind == EVENT_CONTENT {
                let _ = tx
                    .send(FlowEvent::content(event.content, Some(node_id.to_string())))
                    .await;
            } else if event.kind == EVENT_DEBUG {
                ctx.node_record(node_id, kind_str, event.content).await;
            } else if is_system_signal(&event.kind) {
                tracing::debug!(node = %node_id, signal = %event.kind, "system signal");
            } else {
                let envelope = serde_json::from_value::<Envelope>(event.content.clone())
                    .unwrap_or_else(|_| Envelope::new(kind_str, event.content));
                staged.insert(event.kind, envelope);
            }
        }
    }

    for (handle, envelope) in staged.iter() {
        node.core_mut()
            .outputs
            .insert(handle.clone(), envelope.clone());
    }
    node.core_mut().mark_executed();
    if visible {
        let outputs_json: Value = staged
            .iter()
            .map(|(handle, envelope)| (handle.clone(), envelope.to_value()))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let internal = node.internal_state();
        drop(node);
        ctx.node_end(
            node_id,
            kind_str,
            outputs_json,
            internal,
            started.elapsed().as_secs_f64() * 1000.0,
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Static-phase bypass
// ---------------------------------------------------------------------------

/// Recursively mark a static-phase branch bypassed, following static edges
/// only.
async fn bypass_static(
    graph: &FlowGraph,
    start: &str,
    static_edges: &[Edge],
    bypassed: &mut HashSet<String>,
    ctx: &Arc<DebugContext>,
) {
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    while let Some(node_id) = queue.pop_front() {
        if !bypassed.insert(node_id.clone()) {
            continue;
        }
        if let Some(node) = graph.node(&node_id) {
            node.lock().await.core_mut().mark_bypassed();
        }
        let kind = graph.kind(&node_id).unwrap_or(NodeKind::Void);
        if kind != NodeKind::Void {
            ctx.node_bypass(&node_id, kind.as_str(), "static branch not selected")
                .await;
        }
        for edge in static_edges.iter().filter(|e| e.source == node_id) {
            queue.push_back(edge.target.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// The loop executor
// ---------------------------------------------------------------------------

pub(crate) async fn run_loop_graph(
    graph: &FlowGraph,
    run: &RunLog,
    config: &ExecutorConfig,
    ctx: &Arc<DebugContext>,
    tx: &mpsc::Sender<FlowEvent>,
) {
    let Some(loop_id) = graph.loop_id().map(String::from) else {
        return;
    };

    let (handles, configured_cap) = {
        let Some(node) = graph.node(&loop_id) else {
            return;
        };
        let node = node.lock().await;
        (
            node.loop_handles().cloned().unwrap_or_default(),
            node.max_iterations(),
        )
    };
    let max_iterations = configured_cap.unwrap_or(config.max_iterations);

    let edges = classify_edges(&graph.edges, &loop_id, &handles);
    tracing::debug!(
        static_ = edges.static_.len(),
        item = edges.item.len(),
        feedback = edges.feedback.len(),
        end = edges.end.len(),
        "classified loop edges"
    );

    let iteration_nodes = find_iteration_subgraph(&loop_id, &handles, &graph.edges);
    tracing::debug!(?iteration_nodes, "iteration subgraph");

    // Nodes transitively fed by the loop's end output run after the loop,
    // never in the static phase.
    let post_loop_exclusion = {
        let mut set = HashSet::new();
        let mut queue: VecDeque<String> =
            edges.end.iter().map(|e| e.target.clone()).collect();
        while let Some(node_id) = queue.pop_front() {
            if node_id == loop_id || !set.insert(node_id.clone()) {
                continue;
            }
            for edge in edges.static_.iter().filter(|e| e.source == node_id) {
                queue.push_back(edge.target.clone());
            }
        }
        set
    };

    // -----------------------------------------------------------------------
    // Static phase: assemble the loop's inputs.
    // -----------------------------------------------------------------------

    let static_nodes: HashSet<String> = edges
        .static_
        .iter()
        .flat_map(|e| [e.source.clone(), e.target.clone()])
        .filter(|id| id != &loop_id)
        .filter(|id| !post_loop_exclusion.contains(id))
        .filter(|id| !iteration_nodes.contains(id))
        .collect();
    let static_order = kahn_order(&static_nodes, &edges.static_);
    tracing::debug!(?static_order, "static execution order");

    let mut bypassed: HashSet<String> = HashSet::new();
    for node_id in &static_order {
        if bypassed.contains(node_id) {
            tracing::debug!(node = %node_id, "skipping bypassed static node");
            continue;
        }
        apply_inputs(graph, node_id, &edges.static_).await;
        exec_node_inline(graph, node_id, run, ctx, tx).await;

        if graph.kind(node_id) == Some(NodeKind::Conditional) {
            let selected = {
                let node = graph.node(node_id).expect("known node").lock().await;
                node.selected_handle().map(String::from)
            };
            if let Some(selected) = selected {
                let selected_targets: HashSet<&str> = edges
                    .static_
                    .iter()
                    .filter(|e| e.source == *node_id && e.source_handle == selected)
                    .map(|e| e.target.as_str())
                    .collect();
                let to_bypass: Vec<String> = edges
                    .static_
                    .iter()
                    .filter(|e| e.source == *node_id && e.source_handle != selected)
                    .filter(|e| !selected_targets.contains(e.target.as_str()))
                    .map(|e| e.target.clone())
                    .collect();
                for target in to_bypass {
                    bypass_static(graph, &target, &edges.static_, &mut bypassed, ctx).await;
                }
            }
        }
    }

    // Transfer assembled outputs into the loop node.
    for edge in edges.static_.iter().filter(|e| e.target == loop_id) {
        apply_inputs(graph, &loop_id, std::slice::from_ref(edge)).await;
    }

    // -----------------------------------------------------------------------
    // Read and decode the list input.
    // -----------------------------------------------------------------------

    let raw = {
        let node = graph.node(&loop_id).expect("loop node").lock().await;
        node.core().get_input(&handles.list).cloned()
    };

    let mut loop_was_bypassed = false;
    let mut items: Vec<Value> = Vec::new();

    match raw {
        None => {
            let list_source = edges
                .static_
                .iter()
                .find(|e| e.target == loop_id && e.target_handle == handles.list)
                .map(|e| e.source.clone());
            match list_source {
                Some(source) if bypassed.contains(&source) => {
                    tracing::info!("loop list source was bypassed, skipping iterations");
                    loop_was_bypassed = true;
                    bypassed.insert(loop_id.clone());
                    let mut to_mark: Vec<String> = iteration_nodes.iter().cloned().collect();
                    to_mark.sort_unstable();
                    for node_id in to_mark {
                        bypass_static(graph, &node_id, &[], &mut bypassed, ctx).await;
                    }
                    if let Some(node) = graph.node(&loop_id) {
                        node.lock().await.core_mut().mark_bypassed();
                    }
                    ctx.node_bypass(&loop_id, "loop", "list source bypassed").await;
                    for edge in &edges.end {
                        bypass_static(graph, &edge.target, &edges.static_, &mut bypassed, ctx)
                            .await;
                    }
                }
                _ => {
                    ctx.node_error(
                        &loop_id,
                        "loop",
                        "InputError",
                        &format!("loop did not receive input on handle '{}'", handles.list),
                        json!({"required_input": handles.list}),
                    )
                    .await;
                    return;
                }
            }
        }
        Some(raw) => match LoopNode::decode_list(&raw) {
            Ok(decoded) => items = decoded,
            Err((error_type, message)) => {
                ctx.node_error(
                    &loop_id,
                    "loop",
                    error_type,
                    &message,
                    json!({"value_preview": weir_types::preview_of(&raw, 200)}),
                )
                .await;
                return;
            }
        },
    }

    // -----------------------------------------------------------------------
    // Iteration phase.
    // -----------------------------------------------------------------------

    if !loop_was_bypassed {
        // Item and feedback edges plus any ordinary edge touching the
        // subgraph: chains between iteration nodes and static feeds into
        // them.
        let subgraph_edges: Vec<Edge> = {
            let mut all = edges.item.clone();
            all.extend(edges.feedback.iter().cloned());
            all.extend(
                edges
                    .static_
                    .iter()
                    .filter(|e| {
                        iteration_nodes.contains(&e.source) || iteration_nodes.contains(&e.target)
                    })
                    .cloned(),
            );
            all
        };
        let iteration_order = kahn_order(&iteration_nodes, &subgraph_edges);
        tracing::debug!(?iteration_order, "iteration execution order");

        let total = items.len();
        let mut aggregate: Vec<Value> = Vec::new();
        let started = Instant::now();
        tracing::info!(items = total, "loop iterating");

        for (index, item) in items.iter().enumerate() {
            if index >= max_iterations {
                ctx.node_error(
                    &loop_id,
                    "loop",
                    "MaxIterationsExceeded",
                    &format!("loop exceeded max iterations ({max_iterations})"),
                    json!({"iterations_completed": index}),
                )
                .await;
                break;
            }
            if started.elapsed() >= config.total_timeout {
                ctx.node_error(
                    &loop_id,
                    "loop",
                    "TimeoutError",
                    "loop exceeded its total time budget",
                    json!({"iterations_completed": index}),
                )
                .await;
                break;
            }

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let _ = tx
                .send(FlowEvent::LoopProgress {
                    content: LoopProgress::new(&loop_id, index, total, item, elapsed_ms),
                })
                .await;
            ctx.emit(
                DebugEvent::new(DebugEventKind::IterationStart)
                    .with_node(&loop_id, "loop")
                    .with_payload("index", json!(index)),
            )
            .await;

            // Reset per-iteration state: the loop's response/outputs and
            // feedback input, plus every iteration-subgraph node.
            {
                let node = graph.node(&loop_id).expect("loop node");
                let mut node = node.lock().await;
                node.core_mut().reset();
                node.core_mut().clear_input(&handles.feedback);
                node.core_mut().outputs.insert(
                    handles.item.clone(),
                    Envelope::item("loop", item.clone(), index),
                );
            }
            for node_id in &iteration_nodes {
                if let Some(node) = graph.node(node_id) {
                    let mut node = node.lock().await;
                    node.core_mut().reset();
                    node.iteration_reset();
                }
            }

            // Hand the current item to the subgraph's entry nodes.
            for edge in &edges.item {
                apply_inputs(graph, &edge.target, std::slice::from_ref(edge)).await;
            }

            let iteration = async {
                for node_id in &iteration_order {
                    apply_inputs(graph, node_id, &subgraph_edges).await;
                    exec_node_inline(graph, node_id, run, ctx, tx).await;
                    for edge in subgraph_edges.iter().filter(|e| e.source == *node_id) {
                        apply_inputs(graph, &edge.target, std::slice::from_ref(edge)).await;
                    }
                }
            };
            if tokio::time::timeout(config.iteration_timeout, iteration)
                .await
                .is_err()
            {
                ctx.node_error(
                    &loop_id,
                    "loop",
                    "TimeoutError",
                    "loop iteration exceeded its time budget",
                    json!({"index": index}),
                )
                .await;
                break;
            }

            // Feedback is read only after the whole subgraph completed.
            let feedback = {
                let node = graph.node(&loop_id).expect("loop node").lock().await;
                node.core().get_input(&handles.feedback).cloned()
            };
            let feedback = feedback
                .map(|value| unwrap_envelope(&value).clone())
                .unwrap_or(Value::Null);
            tracing::debug!(index, "iteration feedback collected");
            aggregate.push(feedback);
        }

        // Publish the aggregate on the loop's end output.
        {
            let node = graph.node(&loop_id).expect("loop node");
            let mut node = node.lock().await;
            node.core_mut().reset();
            node.core_mut().outputs.insert(
                handles.end.clone(),
                Envelope::new("loop", Value::Array(aggregate)),
            );
            node.core_mut().mark_executed();
        }
        let mut loop_outputs = serde_json::Map::new();
        loop_outputs.insert(
            handles.end.clone(),
            json!({"producer": "loop", "items": total.min(max_iterations)}),
        );
        ctx.node_end(
            &loop_id,
            "loop",
            Value::Object(loop_outputs),
            json!({"iterations": total.min(max_iterations)}),
            started.elapsed().as_secs_f64() * 1000.0,
        )
        .await;

        // End targets re-execute against the aggregated output.
        for edge in &edges.end {
            if let Some(node) = graph.node(&edge.target) {
                node.lock().await.core_mut().reset();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Post-loop phase.
    // -----------------------------------------------------------------------

    let post_loop_nodes: HashSet<String> = {
        let mut set = HashSet::new();
        let mut queue: VecDeque<String> =
            edges.end.iter().map(|e| e.target.clone()).collect();
        while let Some(node_id) = queue.pop_front() {
            if node_id == loop_id
                || iteration_nodes.contains(&node_id)
                || !set.insert(node_id.clone())
            {
                continue;
            }
            for edge in graph.edges.iter().filter(|e| e.source == node_id) {
                queue.push_back(edge.target.clone());
            }
        }
        set
    };
    let post_loop_order = kahn_order(&post_loop_nodes, &graph.edges);
    tracing::debug!(?post_loop_order, "post-loop execution order");

    if !loop_was_bypassed {
        for edge in &edges.end {
            apply_inputs(graph, &edge.target, std::slice::from_ref(edge)).await;
        }
    }

    for node_id in &post_loop_order {
        if bypassed.contains(node_id) {
            tracing::debug!(node = %node_id, "skipping bypassed post-loop node");
            continue;
        }
        if let Some(node) = graph.node(node_id) {
            node.lock().await.core_mut().reset();
        }
        // Inputs come from every edge: loop output and static survivors.
        apply_inputs(graph, node_id, &graph.edges).await;
        exec_node_inline(graph, node_id, run, ctx, tx).await;
        for edge in graph.edges.iter().filter(|e| e.source == *node_id) {
            apply_inputs(graph, &edge.target, std::slice::from_ref(edge)).await;
        }
    }

    tracing::info!("finished loop execution");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, source_handle: &str, target: &str, target_handle: &str) -> Edge {
        Edge {
            id: format!("{source}.{source_handle}->{target}.{target_handle}"),
            source: source.into(),
            source_handle: source_handle.into(),
            target: target.into(),
            target_handle: target_handle.into(),
        }
    }

    fn loop_edges() -> Vec<Edge> {
        vec![
            edge("list_src", "handle_text_output", "loop1", "handle_list"),
            edge("loop1", "handle_item", "worker", "handle_parser_input"),
            edge("worker", "handle_parser_output", "loop1", "handle_loop"),
            edge("loop1", "handle_end", "sink", "in"),
            edge("sink", "handle_end_output", "void1", "handle-void"),
        ]
    }

    #[test]
    fn classification_partitions_edges() {
        let handles = LoopHandles::default();
        let classified = classify_edges(&loop_edges(), "loop1", &handles);
        assert_eq!(classified.item.len(), 1);
        assert_eq!(classified.feedback.len(), 1);
        assert_eq!(classified.end.len(), 1);
        assert_eq!(classified.static_.len(), 2);
        assert_eq!(classified.item[0].target, "worker");
        assert_eq!(classified.end[0].target, "sink");
    }

    #[test]
    fn iteration_subgraph_stops_at_feedback_and_end() {
        let handles = LoopHandles::default();
        let subgraph = find_iteration_subgraph("loop1", &handles, &loop_edges());
        assert_eq!(subgraph, HashSet::from(["worker".to_string()]));
    }

    #[test]
    fn iteration_subgraph_follows_chains() {
        let handles = LoopHandles::default();
        let mut edges = loop_edges();
        edges.push(edge("worker", "aux", "stage2", "in"));
        edges.push(edge("stage2", "handle_parser_output", "loop1", "handle_loop"));
        let subgraph = find_iteration_subgraph("loop1", &handles, &edges);
        assert!(subgraph.contains("worker"));
        assert!(subgraph.contains("stage2"));
        assert!(!subgraph.contains("sink"));
        assert!(!subgraph.contains("loop1"));
    }

    #[test]
    fn kahn_orders_dependencies_first() {
        let nodes: HashSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let edges = vec![edge("a", "h", "b", "in"), edge("b", "h", "c", "in")];
        let order = kahn_order(&nodes, &edges);
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn kahn_appends_cycles_instead_of_failing() {
        let nodes: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let edges = vec![edge("a", "h", "b", "in"), edge("b", "h", "a", "in")];
        let order = kahn_order(&nodes, &edges);
        assert_eq!(order.len(), 2, "cycle members still placed");
    }

    #[test]
    fn kahn_is_deterministic_for_parallel_roots() {
        let nodes: HashSet<String> =
            ["z", "m", "a"].iter().map(|s| s.to_string()).collect();
        let order = kahn_order(&nodes, &[]);
        assert_eq!(order, vec!["a", "m", "z"]);
    }
}

//! Event dispatcher: edge maps, node state machine, output routing, and
//! recursive bypass propagation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use weir_types::Envelope;

use crate::config::ExecutorConfig;
use crate::graph::{Edge, FlowGraph, SharedNode};
use crate::tracker::{InputSlot, NodeInputTracker};

// ---------------------------------------------------------------------------
// Node state machine
// ---------------------------------------------------------------------------

/// Legal transitions: Pending → (Ready) → Executing → Completed | Error;
/// Pending → Bypassed. Completed, Bypassed, and Error are terminal within a
/// non-loop execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Executing,
    Completed,
    Bypassed,
    Error,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Bypassed | NodeState::Error)
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Coordinates event flow between nodes for one execution: builds the
/// incoming/outgoing edge maps and one input tracker per node, routes
/// outputs, and propagates bypass through dead branches.
pub struct EventDispatcher {
    nodes: HashMap<String, SharedNode>,
    incoming: HashMap<String, Vec<Edge>>,
    outgoing: HashMap<String, Vec<Edge>>,
    trackers: HashMap<String, Arc<NodeInputTracker>>,
    states: Mutex<HashMap<String, NodeState>>,
    /// Edges that can no longer fire. A target handle is bypassed once
    /// every edge feeding it is dead, which keeps fan-in targets alive as
    /// long as any source may still produce a value.
    dead_edges: Mutex<HashSet<String>>,
    semaphore: Arc<Semaphore>,
}

impl EventDispatcher {
    pub fn new(graph: &FlowGraph, config: &ExecutorConfig) -> Self {
        let mut incoming: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in &graph.edges {
            incoming.entry(edge.target.clone()).or_default().push(edge.clone());
            outgoing.entry(edge.source.clone()).or_default().push(edge.clone());
        }

        let mut trackers = HashMap::new();
        for node_id in graph.nodes.keys() {
            let expected = incoming
                .get(node_id)
                .map(|edges| {
                    edges
                        .iter()
                        .map(|edge| {
                            (
                                edge.target_handle.clone(),
                                InputSlot {
                                    source_node: edge.source.clone(),
                                    source_handle: edge.source_handle.clone(),
                                    content: None,
                                    received: false,
                                    bypassed: false,
                                },
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            trackers.insert(
                node_id.clone(),
                Arc::new(NodeInputTracker::new(node_id, expected)),
            );
        }

        let states = graph
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeState::Pending))
            .collect();

        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "dispatcher initialized"
        );

        Self {
            nodes: graph.nodes.clone(),
            incoming,
            outgoing,
            trackers,
            states: Mutex::new(states),
            dead_edges: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&SharedNode> {
        self.nodes.get(node_id)
    }

    pub fn tracker(&self, node_id: &str) -> Option<Arc<NodeInputTracker>> {
        self.trackers.get(node_id).cloned()
    }

    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, node_id: &str) -> &[Edge] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with no incoming edges (entry points).
    pub fn source_nodes(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.incoming(id).is_empty())
            .cloned()
            .collect()
    }

    pub fn has_outgoing_handle(&self, node_id: &str, handle: &str) -> bool {
        self.outgoing(node_id)
            .iter()
            .any(|edge| edge.source_handle == handle)
    }

    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self, node_id: &str) -> NodeState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(node_id).copied())
            .unwrap_or(NodeState::Pending)
    }

    pub fn set_state(&self, node_id: &str, state: NodeState) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(entry) = states.get_mut(node_id) {
                tracing::debug!(node = node_id, from = ?*entry, to = ?state, "state change");
                *entry = state;
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.states
            .lock()
            .map(|states| states.values().all(|state| state.is_terminal()))
            .unwrap_or(false)
    }

    /// (completed, bypassed, errors) counts.
    pub fn summary(&self) -> (usize, usize, usize) {
        let states = match self.states.lock() {
            Ok(states) => states,
            Err(_) => return (0, 0, 0),
        };
        let count =
            |wanted: NodeState| states.values().filter(|state| **state == wanted).count();
        (
            count(NodeState::Completed),
            count(NodeState::Bypassed),
            count(NodeState::Error),
        )
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Deliver a value to a node's input handle and notify its tracker.
    pub async fn dispatch_input(&self, target: &str, handle: &str, content: Value) {
        let Some(tracker) = self.trackers.get(target) else {
            tracing::warn!(target, "dispatch to unknown node");
            return;
        };
        if let Some(node) = self.nodes.get(target) {
            node.lock()
                .await
                .core_mut()
                .inputs
                .insert(handle.to_string(), content.clone());
        }
        tracker.receive_input(handle, content).await;
    }

    /// Notify a node that one (or every pending) input is bypassed.
    pub async fn dispatch_bypass(&self, target: &str, handle: Option<&str>) {
        if let Some(tracker) = self.trackers.get(target) {
            tracker.receive_bypass(handle).await;
        }
    }

    /// Route a completed node's outputs along its outgoing edges. Each
    /// edge whose source handle is present delivers the envelope payload to
    /// its target.
    pub async fn propagate_outputs(&self, source: &str, outputs: &HashMap<String, Envelope>) {
        for edge in self.outgoing(source) {
            if let Some(envelope) = outputs.get(&edge.source_handle) {
                self.dispatch_input(&edge.target, &edge.target_handle, envelope.content.clone())
                    .await;
                tracing::debug!(
                    source,
                    source_handle = %edge.source_handle,
                    target = %edge.target,
                    target_handle = %edge.target_handle,
                    "propagated output"
                );
            }
        }
    }

    /// Mark edges dead and propagate the closure.
    ///
    /// A target handle is bypassed once every edge feeding it is dead; a
    /// target left with no real input at all becomes Bypassed, which kills
    /// all of its own outgoing edges in turn. Work-list based, no
    /// recursion.
    async fn mark_edges_dead(&self, initial: Vec<Edge>) {
        let mut queue: VecDeque<Edge> = initial.into();

        while let Some(edge) = queue.pop_front() {
            let newly_dead = self
                .dead_edges
                .lock()
                .map(|mut dead| dead.insert(edge.id.clone()))
                .unwrap_or(false);
            if !newly_dead {
                continue;
            }

            let handle_fully_dead = {
                let dead = match self.dead_edges.lock() {
                    Ok(dead) => dead,
                    Err(_) => continue,
                };
                self.incoming(&edge.target)
                    .iter()
                    .filter(|e| e.target_handle == edge.target_handle)
                    .all(|e| dead.contains(&e.id))
            };
            if !handle_fully_dead {
                continue;
            }

            let Some(tracker) = self.trackers.get(&edge.target) else {
                continue;
            };
            tracker.receive_bypass(Some(&edge.target_handle)).await;

            if tracker.is_bypassed().await && !self.state(&edge.target).is_terminal() {
                self.set_state(&edge.target, NodeState::Bypassed);
                if let Some(node) = self.nodes.get(&edge.target) {
                    node.lock().await.core_mut().mark_bypassed();
                }
                tracing::debug!(node = %edge.target, "node bypassed by dead edges");
                queue.extend(self.outgoing(&edge.target).iter().cloned());
            }
        }
    }

    /// Prune the branches a conditional did not select.
    ///
    /// Edges on the selected handle stay live; every other outgoing edge
    /// dies. A target reachable through the selected handle therefore
    /// counts as selected even when fan-out also reaches it on a bypassed
    /// handle.
    pub async fn propagate_conditional_bypass(
        &self,
        source: &str,
        selected_handle: &str,
    ) -> (HashSet<String>, HashSet<String>) {
        let mut selected_targets = HashSet::new();
        let mut bypassed_targets = HashSet::new();
        let mut dead = Vec::new();

        for edge in self.outgoing(source) {
            if edge.source_handle == selected_handle {
                selected_targets.insert(edge.target.clone());
            } else {
                bypassed_targets.insert(edge.target.clone());
                dead.push(edge.clone());
            }
        }
        // Selected wins over bypassed.
        bypassed_targets.retain(|target| !selected_targets.contains(target));

        self.mark_edges_dead(dead).await;
        (selected_targets, bypassed_targets)
    }

    /// Kill every outgoing edge of a node. Used when a conditional fails
    /// (`__bypass_all__`) and when a node errors or times out, so
    /// dependents do not wait out their input timeout.
    pub async fn handle_bypass_all(&self, source: &str) {
        tracing::warn!(source, "bypassing all downstream targets");
        let edges: Vec<Edge> = self.outgoing(source).to_vec();
        self.mark_edges_dead(edges).await;
    }

    /// Mark a node's still-pending inputs bypassed; if it ends up with no
    /// real input it becomes Bypassed and its outgoing edges die.
    pub async fn recursive_bypass(&self, node_id: &str) {
        if self.state(node_id).is_terminal() {
            return;
        }
        let Some(tracker) = self.trackers.get(node_id) else {
            return;
        };
        tracker.receive_bypass(None).await;
        if tracker.is_bypassed().await {
            self.set_state(node_id, NodeState::Bypassed);
            if let Some(node) = self.nodes.get(node_id) {
                node.lock().await.core_mut().mark_bypassed();
            }
            let edges: Vec<Edge> = self.outgoing(node_id).to_vec();
            self.mark_edges_dead(edges).await;
        }
    }

    /// Close off edges whose source handle was never produced by a
    /// completed (or bypassed) node.
    pub async fn propagate_untriggered(
        &self,
        source: &str,
        outputs: &HashMap<String, Envelope>,
    ) {
        let untriggered: Vec<Edge> = self
            .outgoing(source)
            .iter()
            .filter(|edge| !outputs.contains_key(&edge.source_handle))
            .cloned()
            .collect();
        self.mark_edges_dead(untriggered).await;
    }

    /// Reset trackers and execution state for the given nodes (loop
    /// iterations).
    pub async fn reset_for_iteration(&self, node_ids: &[String]) {
        for node_id in node_ids {
            if let Some(tracker) = self.trackers.get(node_id) {
                tracker.reset().await;
            }
            self.set_state(node_id, NodeState::Pending);
            if let Some(node) = self.nodes.get(node_id) {
                let mut node = node.lock().await;
                node.core_mut().reset();
                node.iteration_reset();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

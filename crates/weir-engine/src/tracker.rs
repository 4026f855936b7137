//! Per-node input tracking and readiness signaling.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use weir_types::{Result, WeirError};

/// One expected input, derived from an incoming edge.
#[derive(Debug, Clone)]
pub struct InputSlot {
    pub source_node: String,
    pub source_handle: String,
    pub content: Option<Value>,
    pub received: bool,
    pub bypassed: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    expected: HashMap<String, InputSlot>,
}

impl TrackerState {
    fn is_ready(&self) -> bool {
        self.expected
            .values()
            .all(|slot| slot.received || slot.bypassed)
    }

    fn received_count(&self) -> usize {
        self.expected.values().filter(|slot| slot.received).count()
    }

    fn should_execute(&self) -> bool {
        if self.expected.is_empty() {
            return true;
        }
        self.is_ready() && self.received_count() > 0
    }

    fn is_bypassed(&self) -> bool {
        if self.expected.is_empty() {
            return false;
        }
        self.is_ready() && self.received_count() == 0
    }
}

/// Tracks which inputs a node is waiting for.
///
/// A handle is received, bypassed, or pending. The readiness signal fires
/// when every expected handle is accounted for; a tracker with no expected
/// inputs is immediately ready. Once ready, a tracker stays ready until an
/// explicit `reset`.
pub struct NodeInputTracker {
    node_id: String,
    state: Mutex<TrackerState>,
    ready: Notify,
}

impl NodeInputTracker {
    pub fn new(node_id: &str, expected: impl IntoIterator<Item = (String, InputSlot)>) -> Self {
        let state = TrackerState {
            expected: expected.into_iter().collect(),
        };
        Self {
            node_id: node_id.to_string(),
            state: Mutex::new(state),
            ready: Notify::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.is_ready()
    }

    pub async fn should_execute(&self) -> bool {
        self.state.lock().await.should_execute()
    }

    pub async fn is_bypassed(&self) -> bool {
        self.state.lock().await.is_bypassed()
    }

    pub async fn expected_handles(&self) -> Vec<String> {
        self.state.lock().await.expected.keys().cloned().collect()
    }

    /// Handles still neither received nor bypassed.
    pub async fn pending_handles(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .expected
            .iter()
            .filter(|(_, slot)| !slot.received && !slot.bypassed)
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Deliver a value to a handle. Returns `true` if this made the node
    /// ready.
    pub async fn receive_input(&self, handle: &str, content: Value) -> bool {
        let became_ready = {
            let mut state = self.state.lock().await;
            match state.expected.get_mut(handle) {
                Some(slot) => {
                    slot.content = Some(content);
                    slot.received = true;
                    slot.bypassed = false;
                }
                None => {
                    tracing::warn!(
                        node = %self.node_id,
                        handle,
                        "received input on unexpected handle"
                    );
                    return false;
                }
            }
            state.is_ready()
        };
        if became_ready {
            self.ready.notify_waiters();
        }
        became_ready
    }

    /// Mark a handle (or every still-pending handle) as bypassed. A
    /// received handle is never overridden.
    pub async fn receive_bypass(&self, handle: Option<&str>) -> bool {
        let became_ready = {
            let mut state = self.state.lock().await;
            match handle {
                Some(handle) => {
                    if let Some(slot) = state.expected.get_mut(handle) {
                        if !slot.received {
                            slot.bypassed = true;
                        }
                    }
                }
                None => {
                    for slot in state.expected.values_mut() {
                        if !slot.received && !slot.bypassed {
                            slot.bypassed = true;
                        }
                    }
                }
            }
            state.is_ready()
        };
        if became_ready {
            self.ready.notify_waiters();
        }
        became_ready
    }

    /// Block until every input is accounted for, then report whether the
    /// node should execute (`false` means it was bypassed).
    pub async fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let wait = async {
            loop {
                let notified = self.ready.notified();
                {
                    let state = self.state.lock().await;
                    if state.is_ready() {
                        return state.should_execute();
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(should_execute) => Ok(should_execute),
            Err(_) => {
                let pending = self.pending_handles().await;
                tracing::error!(
                    node = %self.node_id,
                    ?pending,
                    "timed out waiting for inputs"
                );
                Err(WeirError::InputTimeout {
                    node: self.node_id.clone(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// All received values, keyed by handle.
    pub async fn get_all_inputs(&self) -> HashMap<String, Value> {
        self.state
            .lock()
            .await
            .expected
            .iter()
            .filter(|(_, slot)| slot.received)
            .filter_map(|(handle, slot)| {
                slot.content.clone().map(|content| (handle.clone(), content))
            })
            .collect()
    }

    /// Clear received/bypassed state for re-execution in loops. A tracker
    /// with no expected inputs goes straight back to ready.
    pub async fn reset(&self) {
        {
            let mut state = self.state.lock().await;
            for slot in state.expected.values_mut() {
                slot.content = None;
                slot.received = false;
                slot.bypassed = false;
            }
        }
        // No-input trackers are immediately ready again.
        self.ready.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

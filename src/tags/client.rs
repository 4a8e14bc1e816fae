//! Protocol seam between the tag registry and the controller session.
//!
//! The real OPC UA session lives outside this crate; the registry only sees
//! the [`PlcClient`] trait. Change notifications for subscribed nodes are
//! delivered into a single mpsc channel and drained in arrival order by
//! [`TagRegistry::run`](super::TagRegistry::run), so reactions never run
//! concurrently with each other.

use super::value::TagValue;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A change notification for one subscribed node.
#[derive(Debug, Clone)]
pub struct TagChange {
    /// Node path the change belongs to.
    pub node: String,
    /// The new value reported by the controller.
    pub value: TagValue,
}

/// Client session with the numeric controller.
#[async_trait]
pub trait PlcClient: Send + Sync {
    /// Synchronous read of a node's current value.
    async fn read_node(&self, node: &str) -> CalResult<TagValue>;

    /// Write a scalar value to a node.
    async fn write_node(&self, node: &str, value: &TagValue) -> CalResult<()>;

    /// Declared array width of a node, `None` for scalar nodes.
    async fn array_len(&self, node: &str) -> CalResult<Option<usize>>;

    /// Write one element of a fixed-size array node.
    async fn write_element(&self, node: &str, index: usize, value: &TagValue) -> CalResult<()>;

    /// Open a change-notification channel for a node at the given sampling
    /// interval. Changes arrive on the session's shared change channel.
    async fn subscribe(&self, node: &str, interval: Duration) -> CalResult<()>;

    /// Tear down the change-notification channel for a node.
    async fn unsubscribe(&self, node: &str) -> CalResult<()>;
}

#[derive(Default)]
struct MockState {
    nodes: HashMap<String, TagValue>,
    widths: HashMap<String, usize>,
    subscribed: HashSet<String>,
}

/// In-memory controller used by tests and simulation mode.
///
/// `push_change` plays the controller's role: it stores a value and, when the
/// node is subscribed, emits a change notification exactly like the protocol
/// layer would.
pub struct MockPlc {
    state: Mutex<MockState>,
    changes: mpsc::UnboundedSender<TagChange>,
}

impl MockPlc {
    /// Create a mock session and the change channel its notifications
    /// arrive on.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TagChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(MockState::default()),
                changes: tx,
            }),
            rx,
        )
    }

    /// Seed a node value without emitting a notification.
    pub fn seed(&self, node: &str, value: TagValue) {
        self.state.lock().nodes.insert(node.to_string(), value);
    }

    /// Declare a node as a fixed-size array of the given width.
    pub fn declare_array(&self, node: &str, width: usize) {
        self.state.lock().widths.insert(node.to_string(), width);
    }

    /// Simulate a controller-side write: store the value and notify if the
    /// node is subscribed.
    pub fn push_change(&self, node: &str, value: TagValue) {
        let subscribed = {
            let mut state = self.state.lock();
            state.nodes.insert(node.to_string(), value.clone());
            state.subscribed.contains(node)
        };
        if subscribed {
            let _ = self.changes.send(TagChange {
                node: node.to_string(),
                value,
            });
        }
    }

    /// Current stored value of a node, if any.
    pub fn node_value(&self, node: &str) -> Option<TagValue> {
        self.state.lock().nodes.get(node).cloned()
    }

    pub fn is_subscribed(&self, node: &str) -> bool {
        self.state.lock().subscribed.contains(node)
    }
}

#[async_trait]
impl PlcClient for MockPlc {
    async fn read_node(&self, node: &str) -> CalResult<TagValue> {
        self.state
            .lock()
            .nodes
            .get(node)
            .cloned()
            .ok_or_else(|| CalError::Connection(format!("no such node: {node}")))
    }

    async fn write_node(&self, node: &str, value: &TagValue) -> CalResult<()> {
        self.state
            .lock()
            .nodes
            .insert(node.to_string(), value.clone());
        Ok(())
    }

    async fn array_len(&self, node: &str) -> CalResult<Option<usize>> {
        Ok(self.state.lock().widths.get(node).copied())
    }

    async fn write_element(&self, node: &str, index: usize, value: &TagValue) -> CalResult<()> {
        let mut state = self.state.lock();
        let width = *state
            .widths
            .get(node)
            .ok_or_else(|| CalError::Connection(format!("node is not an array: {node}")))?;
        if index >= width {
            return Err(CalError::Connection(format!(
                "element {index} out of range for {node} (width {width})"
            )));
        }
        let slot = state
            .nodes
            .entry(node.to_string())
            .or_insert_with(|| TagValue::IntArray(vec![0; width]));
        match (slot, value) {
            (TagValue::IntArray(xs), TagValue::Int(v)) => {
                xs.resize(width, 0);
                xs[index] = *v;
            }
            (TagValue::FloatArray(xs), TagValue::Float(v)) => {
                xs.resize(width, 0.0);
                xs[index] = *v;
            }
            (slot @ TagValue::IntArray(_), TagValue::Float(v)) => {
                if let TagValue::IntArray(xs) = slot {
                    xs.resize(width, 0);
                    xs[index] = *v as i64;
                }
            }
            _ => {
                return Err(CalError::Connection(format!(
                    "element type mismatch on {node}"
                )))
            }
        }
        Ok(())
    }

    async fn subscribe(&self, node: &str, _interval: Duration) -> CalResult<()> {
        let current = {
            let mut state = self.state.lock();
            state.subscribed.insert(node.to_string());
            state.nodes.get(node).cloned()
        };
        // The protocol layer reports the current value as the first change.
        if let Some(value) = current {
            let _ = self.changes.send(TagChange {
                node: node.to_string(),
                value,
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, node: &str) -> CalResult<()> {
        self.state.lock().subscribed.remove(node);
        Ok(())
    }
}

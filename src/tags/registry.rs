//! Registry of tag mirrors and the single-threaded change-event worker.

use super::client::{PlcClient, TagChange};
use super::id::TagId;
use super::mirror::{Reaction, TagMirror};
use super::value::TagValue;
use crate::error::{CalError, CalResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Named collection of [`TagMirror`]s covering the whole catalog.
///
/// All change notifications from the protocol layer funnel through one mpsc
/// channel drained by [`TagRegistry::run`]; reactions therefore run strictly
/// in arrival order and never concurrently, regardless of how many tags are
/// subscribed.
pub struct TagRegistry {
    client: Arc<dyn PlcClient>,
    interval: Duration,
    mirrors: HashMap<TagId, Mutex<TagMirror>>,
}

impl TagRegistry {
    /// Build a registry over the full tag catalog.
    pub fn new(client: Arc<dyn PlcClient>, interval: Duration) -> Self {
        let mirrors = TagId::ALL
            .iter()
            .map(|&id| (id, Mutex::new(TagMirror::default())))
            .collect();
        Self {
            client,
            interval,
            mirrors,
        }
    }

    fn mirror(&self, id: TagId) -> &Mutex<TagMirror> {
        // The map is built over TagId::ALL, so every id resolves.
        &self.mirrors[&id]
    }

    /// Read a tag: the cached value when subscribed, otherwise a synchronous
    /// controller read (which also primes the cache).
    pub async fn read(&self, id: TagId) -> CalResult<TagValue> {
        {
            let mirror = self.mirror(id).lock();
            if mirror.is_subscribed() {
                if let Some(value) = mirror.cached() {
                    return Ok(value.clone());
                }
            }
        }
        let value = self.client.read_node(id.node_path()).await?;
        self.mirror(id).lock().prime(value.clone());
        Ok(value)
    }

    /// Last cached value without touching the controller.
    pub fn cached(&self, id: TagId) -> Option<TagValue> {
        self.mirror(id).lock().cached().cloned()
    }

    /// Write a tag value to the controller.
    ///
    /// Subscribed tags are controller outputs and are rejected with
    /// [`CalError::NotWritable`]. Scalars pass through; a sequence no longer
    /// than the node's declared array width is written element-wise into the
    /// node's fixed-size child slots; any other shape fails with
    /// [`CalError::InvalidType`].
    pub async fn write(&self, id: TagId, value: TagValue) -> CalResult<()> {
        if self.mirror(id).lock().is_subscribed() {
            return Err(CalError::NotWritable(id));
        }
        let node = id.node_path();
        if value.is_scalar() {
            self.client.write_node(node, &value).await?;
        } else {
            let width = self.client.array_len(node).await?.ok_or_else(|| {
                CalError::InvalidType {
                    tag: id,
                    reason: "sequence written to a scalar node".to_string(),
                }
            })?;
            match &value {
                TagValue::IntArray(xs) if xs.len() <= width => {
                    for (i, x) in xs.iter().enumerate() {
                        self.client
                            .write_element(node, i, &TagValue::Int(*x))
                            .await?;
                    }
                }
                TagValue::FloatArray(xs) if xs.len() <= width => {
                    for (i, x) in xs.iter().enumerate() {
                        self.client
                            .write_element(node, i, &TagValue::Float(*x))
                            .await?;
                    }
                }
                _ => {
                    return Err(CalError::InvalidType {
                        tag: id,
                        reason: format!("sequence longer than node width {width}"),
                    })
                }
            }
        }
        self.mirror(id).lock().prime(value);
        Ok(())
    }

    /// Open the change-notification channel for a tag.
    pub async fn subscribe(&self, id: TagId) -> CalResult<()> {
        self.client.subscribe(id.node_path(), self.interval).await?;
        self.mirror(id).lock().set_subscribed(true);
        debug!(tag = %id, "subscribed");
        Ok(())
    }

    /// Tear the change-notification channel down and drop the cache.
    pub async fn unsubscribe(&self, id: TagId) -> CalResult<()> {
        self.client.unsubscribe(id.node_path()).await?;
        self.mirror(id).lock().set_subscribed(false);
        Ok(())
    }

    /// Subscribe a batch of tags.
    pub async fn subscribe_all(&self, ids: &[TagId]) -> CalResult<()> {
        for &id in ids {
            self.subscribe(id).await?;
        }
        Ok(())
    }

    /// Unsubscribe every live tag; used at session shutdown.
    pub async fn unsubscribe_all(&self) -> CalResult<()> {
        for &id in TagId::ALL {
            if self.mirror(id).lock().is_subscribed() {
                self.unsubscribe(id).await?;
            }
        }
        Ok(())
    }

    /// Attach a named reaction to a tag (idempotent by name).
    pub fn attach_reaction<F>(&self, id: TagId, name: &str, reaction: F)
    where
        F: FnMut(&TagValue) + Send + 'static,
    {
        self.mirror(id)
            .lock()
            .attach_reaction(name, Box::new(reaction) as Reaction);
    }

    /// Detach a named reaction; silent no-op when missing.
    pub fn detach_reaction(&self, id: TagId, name: &str) {
        self.mirror(id).lock().detach_reaction(name);
    }

    /// Apply one change notification: update the cache and fire reactions if
    /// the value differs. Notifications for unsubscribed or unknown nodes are
    /// dropped (they can trail an unsubscribe).
    pub fn apply_change(&self, change: TagChange) {
        let Some(id) = TagId::from_node(&change.node) else {
            warn!(node = %change.node, "change for a node outside the catalog");
            return;
        };
        let mut mirror = self.mirror(id).lock();
        if !mirror.is_subscribed() {
            return;
        }
        mirror.apply_change(change.value);
    }

    /// Drain the shared change channel until the protocol session closes.
    ///
    /// This is the only place reactions run, which is what serializes them.
    pub async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<TagChange>) {
        while let Some(change) = changes.recv().await {
            self.apply_change(change);
        }
        error!("controller change channel closed; tag loop shutting down");
    }
}

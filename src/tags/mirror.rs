//! Local mirror of a single controller tag.

use super::value::TagValue;

pub(crate) type Reaction = Box<dyn FnMut(&TagValue) + Send>;

/// Cached state for one tag: the last known value, whether the tag is in
/// live subscription mode, and the ordered reaction list. The registry
/// keys mirrors by [`super::TagId`].
///
/// Invariant: once subscribed, the cached value is mutated only by the
/// change-notification path; the controller is the writer of record.
#[derive(Default)]
pub struct TagMirror {
    subscribed: bool,
    cache: Option<TagValue>,
    reactions: Vec<(String, Reaction)>,
}

impl TagMirror {
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn cached(&self) -> Option<&TagValue> {
        self.cache.as_ref()
    }

    pub(crate) fn set_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
        if !subscribed {
            self.cache = None;
        }
    }

    /// Store a value without firing reactions (synchronous-read path).
    pub(crate) fn prime(&mut self, value: TagValue) {
        self.cache = Some(value);
    }

    /// Apply a change notification. Reactions fire in attachment order, and
    /// only when the incoming value differs from the cached one.
    pub(crate) fn apply_change(&mut self, value: TagValue) -> bool {
        let changed = self.cache.as_ref() != Some(&value);
        self.cache = Some(value);
        if changed {
            // Borrow the freshly stored value; `cache` is Some by construction.
            if let Some(current) = &self.cache {
                let current = current.clone();
                for (_, reaction) in &mut self.reactions {
                    reaction(&current);
                }
            }
        }
        changed
    }

    /// Attach a named reaction. Attaching the same name twice is a no-op.
    pub fn attach_reaction(&mut self, name: &str, reaction: Reaction) {
        if self.reactions.iter().any(|(n, _)| n == name) {
            return;
        }
        self.reactions.push((name.to_string(), reaction));
    }

    /// Detach a reaction by name; silently does nothing if absent.
    pub fn detach_reaction(&mut self, name: &str) {
        self.reactions.retain(|(n, _)| n != name);
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions.len()
    }
}

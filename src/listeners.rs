//! Inbound message fan-out keyed by [`MessageKind`].
//!
//! Listeners are owned by the application, not by any one connection, so they
//! survive reconnects. Identity is pointer identity of the [`Listener`] `Arc`:
//! keep the handle returned by [`listener`] (or a clone of it) to remove the
//! registration later.

use std::fmt;
use std::sync::Arc;

use crate::protocol::{MessageKind, ServerMessage};

/// A shared handler invoked with every inbound message of its kind.
pub type Listener = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Wrap a closure into a [`Listener`] handle.
pub fn listener<F>(handler: F) -> Listener
where
    F: Fn(&ServerMessage) + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Ordered list of `(kind, listener)` registrations.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<(MessageKind, Listener)>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. Registering the same pair twice makes
    /// it fire twice.
    pub fn add(&mut self, kind: MessageKind, listener: Listener) {
        self.entries.push((kind, listener));
    }

    /// Remove every registration equal to `(kind, listener)`.
    ///
    /// Both halves must match: a registration of the same handler under a
    /// different kind, or of a different handler under the same kind, is left
    /// in place. Returns `true` if anything was removed.
    pub fn remove(&mut self, kind: MessageKind, listener: &Listener) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(k, l)| !(*k == kind && Arc::ptr_eq(l, listener)));
        self.entries.len() != before
    }

    /// Snapshot of the listeners registered for `kind`, in registration order.
    ///
    /// Callers invoke the snapshot after releasing any lock around the
    /// registry, so handlers may add or remove listeners themselves.
    pub fn listeners_for(&self, kind: MessageKind) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(kind, _)| kind))
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn log(message: &str) -> ServerMessage {
        ServerMessage::Log {
            message: message.into(),
        }
    }

    fn chat(message: &str) -> ServerMessage {
        ServerMessage::ChatMessage {
            message: message.into(),
            username: "Bob".into(),
        }
    }

    /// Fire a message the way the connection does: snapshot, then invoke.
    fn fire(registry: &ListenerRegistry, message: &ServerMessage) -> usize {
        let targets = registry.listeners_for(message.kind());
        for target in &targets {
            target(message);
        }
        targets.len()
    }

    fn recorder(seen: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let seen = Arc::clone(seen);
        listener(move |msg| seen.lock().unwrap().push(format!("{tag}:{}", msg.kind())))
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.add(MessageKind::Log, recorder(&seen, "first"));
        registry.add(MessageKind::Log, recorder(&seen, "second"));
        registry.add(MessageKind::ChatMessage, recorder(&seen, "chat"));

        assert_eq!(fire(&registry, &log("x")), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first:Log", "second:Log"]);
    }

    #[test]
    fn removal_requires_kind_and_handler_to_match() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let h = recorder(&seen, "h");
        let k = recorder(&seen, "k");
        let mut registry = ListenerRegistry::new();
        registry.add(MessageKind::Log, Arc::clone(&h));
        registry.add(MessageKind::ChatMessage, Arc::clone(&k));

        // Right handler, wrong kind: nothing removed.
        assert!(!registry.remove(MessageKind::ChatMessage, &h));
        // Right kind, wrong handler: nothing removed.
        assert!(!registry.remove(MessageKind::Log, &k));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(MessageKind::Log, &h));
        assert_eq!(registry.len(), 1);

        fire(&registry, &log("dropped"));
        fire(&registry, &chat("kept"));
        assert_eq!(*seen.lock().unwrap(), vec!["k:ChatMessage"]);
    }

    #[test]
    fn same_handler_under_two_kinds_is_removed_per_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let h = recorder(&seen, "h");
        let mut registry = ListenerRegistry::new();
        registry.add(MessageKind::Log, Arc::clone(&h));
        registry.add(MessageKind::ChatMessage, Arc::clone(&h));

        assert!(registry.remove(MessageKind::Log, &h));
        fire(&registry, &log("a"));
        fire(&registry, &chat("b"));
        assert_eq!(*seen.lock().unwrap(), vec!["h:ChatMessage"]);
    }

    #[test]
    fn equal_closures_are_distinct_listeners() {
        let a = listener(|_| {});
        let b = listener(|_| {});
        let mut registry = ListenerRegistry::new();
        registry.add(MessageKind::Log, Arc::clone(&a));

        assert!(!registry.remove(MessageKind::Log, &b));
        assert!(registry.remove(MessageKind::Log, &a));
        assert!(registry.is_empty());
    }
}

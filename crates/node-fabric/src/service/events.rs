//! Synchronous observer registry.
//!
//! Callbacks run on the emitting task, at the point of the state change.
//! They must not block and must not subscribe or emit re-entrantly on the
//! same hub while holding their own locks.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::domain::{EventKind, NodesEvent};

type Callback = Arc<dyn Fn(&NodesEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, EventKind, Callback)>,
}

/// Registry of event callbacks, keyed by event kind.
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Arc<Mutex<Listeners>>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.lock().entries.len())
            .finish()
    }
}

impl EventHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`.
    ///
    /// The callback stays registered until the returned handle is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&NodesEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, kind, Arc::new(callback)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Invoke every callback registered for the event's kind.
    pub fn emit(&self, event: NodesEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .listeners
            .lock()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();
        trace!(?kind, listeners = callbacks.len(), "Emitting event");
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Number of registered callbacks.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

/// Registration handle; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        listeners.lock().entries.retain(|(id, _, _)| *id != self.id);
    }
}

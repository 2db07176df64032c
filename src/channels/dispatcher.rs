use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Typed publish/subscribe fan-out over a channel's named events.
///
/// Handlers are isolated: one panicking handler never prevents delivery to
/// the rest. All handlers are released on channel teardown so a stale
/// handler from a previous user session cannot fire after a new login.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a named event. Multiple handlers per event are
    /// supported; each registration returns its own [`Subscription`].
    pub fn subscribe(
        self: &Arc<Self>,
        event: &str,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Subscription {
            event: event.to_string(),
            id,
            dispatcher: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver a payload to every handler registered for `event`.
    pub fn emit(&self, event: &str, payload: Value) {
        // Snapshot outside the lock so a handler can subscribe/unsubscribe
        // without deadlocking.
        let snapshot: Vec<Handler> = match self.handlers.lock() {
            Ok(handlers) => handlers
                .get(event)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        for handler in snapshot {
            let payload = payload.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                warn!(event = %event, "event handler panicked; continuing delivery");
            }
        }
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .map(|handlers| handlers.get(event).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Release every handler (channel teardown / logout).
    pub fn clear(&self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
    }

    fn remove(&self, event: &str, id: u64) {
        if let Ok(mut handlers) = self.handlers.lock() {
            if let Some(entries) = handlers.get_mut(event) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    handlers.remove(event);
                }
            }
        }
    }
}

/// Handle for removing a registered handler.
///
/// `unsubscribe` is idempotent; dropping the handle does NOT unsubscribe, so
/// call sites can register and forget until teardown.
pub struct Subscription {
    event: String,
    id: u64,
    dispatcher: Weak<EventDispatcher>,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.remove(&self.event, self.id);
            }
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

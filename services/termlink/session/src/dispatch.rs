//! Subscriber registry for inbound messages and lifecycle events.
//!
//! Handlers are invoked synchronously, in registration order, on a snapshot
//! of the subscriber list taken when publishing starts. A handler that panics
//! is logged and skipped; the remaining handlers still receive the event.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Boxed subscriber callback
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Subscriber list for one event stream
pub struct DispatchRegistry<T> {
    /// Stream name used in logs
    name: &'static str,
    /// Registered handlers in subscription order
    subscribers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    /// Next id to hand out
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for DispatchRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("name", &self.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> DispatchRegistry<T> {
    /// Create an empty registry
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every handler registered at call time.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    error!("{} handler error: {}", self.name, detail);
                }
            }
        }
        delivered
    }
}

// src/bus/hub.rs

//! Subscriber table shared by the bus transports

use super::{Signal, SignalKind};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Notification callback
pub type SignalHandler = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: SignalKind,
    handler: SignalHandler,
}

/// Kind-indexed subscriber list
///
/// Delivery snapshots the matching handlers under the lock and invokes
/// them after releasing it, so a handler may subscribe or unsubscribe.
#[derive(Default)]
pub struct SignalHub {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber { id, kind, handler });
        trace!("subscribed {:?} to {:?}", id, kind);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Invoke every handler subscribed to the signal's kind
    ///
    /// Returns the number of handlers called.
    pub fn deliver(&self, signal: &Signal) -> usize {
        let kind = signal.kind();
        let handlers: Vec<SignalHandler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &handlers {
            handler(signal);
        }
        handlers.len()
    }

    /// Number of live subscriptions for `kind`
    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }
}

// src/registry.rs

//! Signal registry and completion deduplication
//!
//! A flow waiting for a daemon completion signal creates a
//! [`PendingRequest`] and arms it through the [`SignalRegistry`]: a bus
//! subscription whose callback tries the request's fire-once gate. A slave
//! flow may also reconcile by polling the daemon and firing the same gate
//! with a synthesized result. Whichever path gets there first wins; the
//! other observes a spent gate and returns.
//!
//! ```text
//!   signal callback ──┐
//!                     ├── gate.try_fire() ── true ──► completion.complete(v)
//!   poll reconcile ───┘                      false ─► "already consumed"
//! ```
//!
//! After waking, the waiting flow consumes its registration and drops the
//! subscription. Doing that on the flow's own thread keeps the bus delivery
//! path free of registry locking.

use crate::bus::{DaemonBus, Signal, SignalKind, SubscriptionId};
use crate::sync::{Completion, FireOnceGate};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Whether this client issued the request it waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This client issued the RPC
    Master,
    /// Another client issued it; this one only observes
    Slave,
}

/// How a pending request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Completion handler fired with this result
    Completed(T),
    /// Abandoned during shutdown
    Aborted,
}

/// One in-flight deduplicated daemon request
pub struct PendingRequest<T> {
    kind: SignalKind,
    role: Role,
    gate: FireOnceGate,
    completion: Completion<Resolution<T>>,
}

impl<T> PendingRequest<T> {
    pub fn new(kind: SignalKind, role: Role) -> Arc<Self> {
        Arc::new(Self {
            kind,
            role,
            gate: FireOnceGate::new(),
            completion: Completion::new(),
        })
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the completion handler unless another path already did
    pub fn fire(&self, value: T) -> bool {
        if !self.gate.try_fire() {
            debug!("{:?}: already consumed", self.kind);
            return false;
        }
        self.completion.complete(Resolution::Completed(value));
        true
    }

    /// Resolve as aborted unless already fired
    pub fn abort(&self) -> bool {
        if !self.gate.try_fire() {
            return false;
        }
        self.completion.complete(Resolution::Aborted);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.gate.has_fired()
    }

    /// Block until the request resolves
    pub fn wait(&self) -> Resolution<T> {
        self.completion.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Resolution<T>> {
        self.completion.wait_timeout(timeout)
    }
}

struct Registration {
    subscription: SubscriptionId,
    abort: Box<dyn Fn() + Send + Sync>,
}

/// Kind to armed-subscription bookkeeping
#[derive(Default)]
pub struct SignalRegistry {
    entries: Mutex<HashMap<SignalKind, VecDeque<Registration>>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `request` to its completion signal
    ///
    /// `extract` turns a delivered signal into the completion result; the
    /// subscription and its registry entry are created atomically.
    pub fn arm<T, F>(
        &self,
        bus: &dyn DaemonBus,
        request: &Arc<PendingRequest<T>>,
        extract: F,
    ) -> SubscriptionId
    where
        T: Send + 'static,
        F: Fn(&Signal) -> Option<T> + Send + Sync + 'static,
    {
        let kind = request.kind();
        let mut entries = self.entries.lock();

        let pending = Arc::clone(request);
        let subscription = bus.subscribe(
            kind,
            Arc::new(move |signal| {
                if let Some(value) = extract(signal) {
                    pending.fire(value);
                }
            }),
        );

        let aborter = Arc::clone(request);
        entries.entry(kind).or_default().push_back(Registration {
            subscription,
            abort: Box::new(move || {
                aborter.abort();
            }),
        });
        debug!("armed {:?} for {:?}", subscription, kind);
        subscription
    }

    /// Remove a registration and its subscription
    ///
    /// Returns `false` if it was already consumed.
    pub fn consume(&self, bus: &dyn DaemonBus, kind: SignalKind, id: SubscriptionId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let Some(queue) = entries.get_mut(&kind) else {
                return false;
            };
            match queue.iter().position(|r| r.subscription == id) {
                Some(index) => {
                    queue.remove(index);
                    true
                }
                None => false,
            }
        };

        if removed {
            bus.unsubscribe(id);
        } else {
            debug!("{:?}: registration {:?} already consumed", kind, id);
        }
        removed
    }

    /// Number of armed registrations for `kind`
    pub fn pending_count(&self, kind: SignalKind) -> usize {
        self.entries.lock().get(&kind).map_or(0, VecDeque::len)
    }

    /// Resolve every armed request as aborted
    pub fn abort_all(&self) -> usize {
        let entries = self.entries.lock();
        let mut aborted = 0;
        for registration in entries.values().flatten() {
            (registration.abort)();
            aborted += 1;
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::DaemonActivity;
    use crate::bus::LoopbackDaemon;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn repositories_updated(signal: &Signal) -> Option<i32> {
        match signal {
            Signal::RepositoriesUpdated { result, .. } => Some(*result),
            _ => None,
        }
    }

    #[test]
    fn test_signal_fires_completion() {
        let daemon = LoopbackDaemon::new();
        let registry = SignalRegistry::new();
        let request = PendingRequest::new(SignalKind::RepositoriesUpdated, Role::Master);

        let id = registry.arm(&daemon, &request, repositories_updated);
        assert_eq!(registry.pending_count(SignalKind::RepositoriesUpdated), 1);

        daemon.emit(Signal::RepositoriesUpdated {
            result: 3,
            message: String::new(),
        });
        assert_eq!(request.wait(), Resolution::Completed(3));

        assert!(registry.consume(&daemon, SignalKind::RepositoriesUpdated, id));
        assert!(!registry.consume(&daemon, SignalKind::RepositoriesUpdated, id));
        assert_eq!(daemon.subscriber_count(SignalKind::RepositoriesUpdated), 0);
    }

    #[test]
    fn test_signal_and_reconciliation_race_fire_once() {
        for _ in 0..200 {
            let daemon = Arc::new(LoopbackDaemon::new());
            daemon.set_activity(DaemonActivity::Idle);
            let registry = SignalRegistry::new();
            let request = PendingRequest::new(SignalKind::RepositoriesUpdated, Role::Slave);
            registry.arm(daemon.as_ref(), &request, repositories_updated);

            let handled = Arc::new(AtomicUsize::new(0));
            let start = Arc::new(Barrier::new(2));

            let signal_path = {
                let daemon = Arc::clone(&daemon);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    daemon.emit(Signal::RepositoriesUpdated {
                        result: 0,
                        message: "ok".to_string(),
                    });
                })
            };
            let reconcile_path = {
                let daemon = Arc::clone(&daemon);
                let request = Arc::clone(&request);
                let handled = Arc::clone(&handled);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    if daemon.activity().unwrap() != DaemonActivity::UpdatingRepositories
                        && request.fire(99)
                    {
                        handled.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };
            signal_path.join().unwrap();
            reconcile_path.join().unwrap();

            let signal_won = match request.wait() {
                Resolution::Completed(0) => 1,
                Resolution::Completed(99) => 0,
                other => panic!("unexpected resolution {:?}", other),
            };
            assert_eq!(signal_won + handled.load(Ordering::SeqCst), 1);
            assert!(!request.fire(1));
        }
    }

    #[test]
    fn test_abort_all_wakes_waiters() {
        let daemon = LoopbackDaemon::new();
        let registry = Arc::new(SignalRegistry::new());
        let request = PendingRequest::new(SignalKind::ApplicationsManaged, Role::Master);
        let id = registry.arm(&daemon, &request, |signal| match signal {
            Signal::ApplicationsManaged { success } => Some(*success),
            _ => None,
        });

        let waiter = {
            let request = Arc::clone(&request);
            thread::spawn(move || request.wait())
        };
        assert_eq!(registry.abort_all(), 1);
        assert_eq!(waiter.join().unwrap(), Resolution::Aborted);

        // A late signal finds the gate spent
        daemon.emit(Signal::ApplicationsManaged { success: true });
        assert!(registry.consume(&daemon, SignalKind::ApplicationsManaged, id));
    }
}

// src/bus/loopback.rs

//! In-process daemon stand-in
//!
//! `LoopbackDaemon` answers calls from scripted state and broadcasts
//! signals to every subscriber, so several controllers can share one
//! instance the way several client processes share the real daemon.
//!
//! Accepted requests move the reported activity to the matching daemon
//! activity; emitting a completion signal moves it back to idle.

use super::{
    AppAction, AppRef, Call, DaemonBus, Reply, Signal, SignalHandler, SignalHub, SignalKind,
    SubscriptionId,
};
use crate::Result;
use crate::activity::DaemonActivity;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

struct LoopbackState {
    /// Answer for request methods without a scripted answer
    default_accept: bool,
    /// One-shot answers per method, consumed in order
    scripted: HashMap<&'static str, VecDeque<bool>>,
    activity: DaemonActivity,
    queue_length: u32,
    api: u32,
    exclusive: bool,
    actions: HashMap<AppRef, AppAction>,
    accepted_licenses: Vec<String>,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            default_accept: true,
            scripted: HashMap::new(),
            activity: DaemonActivity::Idle,
            queue_length: 0,
            api: 0,
            exclusive: false,
            actions: HashMap::new(),
            accepted_licenses: Vec::new(),
        }
    }
}

/// Scriptable in-process daemon
#[derive(Default)]
pub struct LoopbackDaemon {
    hub: SignalHub,
    state: Mutex<LoopbackState>,
    calls: Mutex<Vec<Call>>,
    call_made: Condvar,
}

impl LoopbackDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for request methods with no scripted answer left
    pub fn set_default_accept(&self, accept: bool) {
        self.state.lock().default_accept = accept;
    }

    /// Queue one answer for the next `method` request
    pub fn script(&self, method: &'static str, accept: bool) {
        self.state
            .lock()
            .scripted
            .entry(method)
            .or_default()
            .push_back(accept);
    }

    pub fn set_activity(&self, activity: DaemonActivity) {
        self.state.lock().activity = activity;
    }

    pub fn set_queue_length(&self, length: u32) {
        self.state.lock().queue_length = length;
    }

    pub fn set_api(&self, api: u32) {
        self.state.lock().api = api;
    }

    pub fn set_exclusive(&self, exclusive: bool) {
        self.state.lock().exclusive = exclusive;
    }

    pub fn accepted_licenses(&self) -> Vec<String> {
        self.state.lock().accepted_licenses.clone()
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Number of calls received for `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method() == method)
            .count()
    }

    /// Block until `count` calls to `method` were received
    pub fn wait_for_calls(&self, method: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut calls = self.calls.lock();
        loop {
            if calls.iter().filter(|c| c.method() == method).count() >= count {
                return true;
            }
            if self.call_made.wait_until(&mut calls, deadline).timed_out() {
                return calls.iter().filter(|c| c.method() == method).count() >= count;
            }
        }
    }

    /// Number of live subscriptions for `kind`
    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.hub.subscriber_count(kind)
    }

    /// Broadcast `signal` to every subscriber on the calling thread
    pub fn emit(&self, signal: Signal) -> usize {
        match &signal {
            Signal::ActivityStarted { activity } => self.set_activity(*activity),
            Signal::RepositoriesUpdated { .. } | Signal::ApplicationsManaged { .. } => {
                self.set_activity(DaemonActivity::Idle)
            }
            _ => {}
        }
        debug!("loopback emit {:?}", signal.kind());
        self.hub.deliver(&signal)
    }

    fn request(&self, method: &'static str, activity: DaemonActivity) -> Reply {
        let mut state = self.state.lock();
        let scripted = state
            .scripted
            .get_mut(method)
            .and_then(|answers| answers.pop_front());
        let accept = scripted.unwrap_or(state.default_accept);
        if accept {
            state.activity = activity;
        }
        Reply::Accepted(accept)
    }
}

impl DaemonBus for LoopbackDaemon {
    fn call(&self, call: Call) -> Result<Reply> {
        let method = call.method();
        let reply = match &call {
            Call::UpdateRepositories { .. } => {
                self.request(method, DaemonActivity::UpdatingRepositories)
            }
            Call::EnqueueApplicationAction {
                package_id,
                repository_id,
                action,
                ..
            } => {
                let reply = self.request(method, DaemonActivity::ManagingApplications);
                if reply == Reply::Accepted(true) {
                    let mut state = self.state.lock();
                    state
                        .actions
                        .insert(AppRef::new(*package_id, repository_id.clone()), *action);
                    state.queue_length += 1;
                }
                reply
            }
            Call::UpgradeSystem { .. } => self.request(method, DaemonActivity::UpgradingSystem),
            Call::AcceptLicenses { license_ids } => {
                self.state
                    .lock()
                    .accepted_licenses
                    .extend(license_ids.iter().cloned());
                Reply::Accepted(true)
            }
            Call::Pong => Reply::Ack,
            Call::Activity => Reply::Activity(self.state.lock().activity),
            Call::ActionQueueLength => Reply::Count(self.state.lock().queue_length),
            Call::Action {
                package_id,
                repository_id,
            } => Reply::Action(
                self.state
                    .lock()
                    .actions
                    .get(&AppRef::new(*package_id, repository_id.clone()))
                    .copied(),
            ),
            Call::Exclusive => Reply::Exclusive(self.state.lock().exclusive),
            Call::Api => Reply::Api(self.state.lock().api),
        };

        self.calls.lock().push(call);
        self.call_made.notify_all();
        Ok(reply)
    }

    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        self.hub.subscribe(kind, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

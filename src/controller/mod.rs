// src/controller/mod.rs

//! Service controller
//!
//! One [`ServiceController`] per client process owns everything the request
//! flows coordinate on: the local activity state, the activity barrier, the
//! shared resource locker, the signal registry and the checkpoint bridge.
//!
//! # Request flows
//!
//! Every flow runs on its own named worker and follows the same template:
//!
//! ```text
//!  busy(activity) ─► barrier.writer_acquire() ─► checkpoints (master)
//!       │                                              │ declined ─► unwind
//!       ▼                                              ▼
//!  arm completion ─► RPC (master) / poll daemon (slave)
//!       │                   │ rejected ─► consume, unwind
//!       ▼                   ▼
//!  release local handles ─► wait ─► consume ─► release local handles
//!       ─► barrier.writer_release() ─► unbusy ─► report to UI
//! ```
//!
//! A client whose request the daemon accepted is the master of that
//! activity. Every other client learns about it through a resources unlock
//! request and runs the same flow as a slave, observing completion without
//! issuing an RPC of its own.

mod applications;
mod repositories;
mod signals;
mod upgrade;

use crate::activity::{ActivityError, ActivityState, LocalActivity};
use crate::barrier::ActivityBarrier;
use crate::bus::{AppAction, AppRef, DaemonBus, SubscriptionId};
use crate::catalog::{LicenseMap, PackageCatalog, StaticCatalog};
use crate::checkpoint::{CheckpointBridge, LicenseDecision, LicenseStore};
use crate::config::ClientConfig;
use crate::locker::{FileResourceLock, ResourceLock, SharedLocker};
use crate::registry::{PendingRequest, Resolution, Role, SignalRegistry};
use crate::resources::{LocalResources, RepositoryHandles};
use crate::transaction::{ApplicationTransaction, TransactionState, TransactionTracker};
use crate::ui::{Notification, UiEvent, UiHandle};
use crate::workers::{FlowHandle, Workers};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shown when the daemon or this process is already running an activity
pub const ACTIVITY_IN_PROGRESS: &str = "Another activity is currently in progress";

/// How a request flow ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The daemon finished the activity
    Completed {
        success: bool,
        message: Option<String>,
    },
    /// Joined the running application batch; its span reports completion
    Enqueued,
    /// Another local activity is in progress
    Busy,
    /// The daemon refused the request
    Rejected,
    /// A checkpoint was declined
    Declined,
    /// Abandoned during shutdown
    Cancelled,
}

impl FlowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FlowOutcome::Completed { success: true, .. } | FlowOutcome::Enqueued
        )
    }
}

pub(crate) struct Inner {
    bus: Arc<dyn DaemonBus>,
    activity: ActivityState,
    barrier: ActivityBarrier,
    locker: SharedLocker,
    registry: SignalRegistry,
    checkpoints: CheckpointBridge,
    catalog: Arc<dyn PackageCatalog>,
    resources: Option<Arc<dyn LocalResources>>,
    ui: UiHandle,
    tracker: TransactionTracker,
    /// "Please wait" indicator currently shown
    please_wait: Mutex<bool>,
    /// Serializes application checkpoints and enqueue calls
    application_request: Mutex<()>,
    /// Held by the repository update flow for its whole span
    repositories: Mutex<()>,
    workers: Workers,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    closing: AtomicBool,
    supported_apis: Vec<u32>,
    notification_timeout: Duration,
}

/// Open activity span: local activity committed and barrier held
///
/// Dropping it releases the barrier, then leaves the activity.
struct ActivitySpan<'a> {
    inner: &'a Inner,
    activity: LocalActivity,
}

impl Drop for ActivitySpan<'_> {
    fn drop(&mut self) {
        self.inner.barrier.writer_release();
        if let Err(e) = self.inner.activity.unbusy(self.activity) {
            warn!("Leaving {} failed: {}", self.activity, e);
        }
    }
}

impl Inner {
    fn open_span(
        &self,
        activity: LocalActivity,
    ) -> std::result::Result<ActivitySpan<'_>, ActivityError> {
        self.activity.busy(activity)?;
        self.barrier.writer_acquire();
        Ok(ActivitySpan {
            inner: self,
            activity,
        })
    }

    fn post(&self, event: UiEvent) {
        self.ui.post(event);
    }

    /// Show or hide the "please wait" indicator, once per change
    fn please_wait(&self, show: bool) {
        let mut shown = self.please_wait.lock();
        if *shown != show {
            *shown = show;
            self.post(UiEvent::PleaseWait(show));
        }
    }

    /// Switch the UI to the work view for `activity`
    fn begin_work(&self, activity: LocalActivity, lock_ui: bool, role: Role) {
        self.post(UiEvent::NotificationsCleared);
        self.post(UiEvent::TerminalReset);
        self.post(UiEvent::StartWorking { activity, lock_ui });
        if role == Role::Master {
            self.please_wait(true);
        }
    }

    /// Close local handles on shared package state
    fn release_local_resources(&self, clear_views: bool) {
        if let Some(resources) = &self.resources
            && let Err(e) = resources.release()
        {
            warn!("Failed to release local resources: {}", e);
        }
        if clear_views {
            self.post(UiEvent::ViewsCleared);
        }
    }

    fn notify_in_progress(&self) {
        self.ui
            .notify(Notification::error(ACTIVITY_IN_PROGRESS).dismissible());
    }

    fn notify_timed(&self, message: String) {
        self.ui
            .notify(Notification::info(message).with_timeout(self.notification_timeout));
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Abort `request` right away if shutdown already started
    fn guard_shutdown<T>(&self, request: &PendingRequest<T>) {
        if self.is_closing() && request.abort() {
            debug!("{:?}: armed during shutdown, aborted", request.kind());
        }
    }

    /// Slave side of the race: fire `request` if the daemon already finished
    fn reconcile<T>(&self, request: &PendingRequest<T>, activity: LocalActivity, synthesized: T) {
        match self.bus.activity() {
            Ok(current) if current != activity.daemon_activity() => {
                debug!("daemon is {} already, reconciling {}", current, activity);
                request.fire(synthesized);
            }
            Ok(_) => debug!("daemon still running {}", activity),
            Err(e) => warn!("Cannot poll daemon activity: {}", e),
        }
    }

    /// Wait for `request` with local handles released on both sides
    fn await_completion<T>(
        &self,
        request: &PendingRequest<T>,
        subscription: SubscriptionId,
        clear_views: bool,
    ) -> Resolution<T> {
        self.release_local_resources(clear_views);
        let resolution = request.wait();
        self.registry
            .consume(self.bus.as_ref(), request.kind(), subscription);
        self.release_local_resources(clear_views);
        self.post(UiEvent::ProgressReset);
        self.please_wait(false);
        resolution
    }

    /// Undo a master request the daemon did not take
    fn unwind_request<T>(&self, request: &PendingRequest<T>, subscription: SubscriptionId) {
        self.registry
            .consume(self.bus.as_ref(), request.kind(), subscription);
        self.please_wait(false);
    }

    /// A slave flow observed completion: give the daemon its unlock
    fn release_hold(&self) {
        if let Err(e) = self.locker.unlock() {
            warn!("Failed to release shared resources lock: {}", e);
        }
    }

    /// License checkpoint; `false` when declined
    fn license_checks(&self, licenses: &LicenseMap) -> bool {
        if self.is_closing() {
            debug!("shutting down, skipping license checkpoint");
            return false;
        }
        let decision = self
            .checkpoints
            .license_checkpoint(licenses, |app| self.catalog.name(app));
        match decision {
            LicenseDecision::NotNeeded => true,
            LicenseDecision::Declined => false,
            LicenseDecision::Accepted { remember } => {
                if !remember.is_empty() {
                    if let Err(e) = self.checkpoints.licenses().remember(&remember) {
                        warn!("Failed to store accepted licenses: {}", e);
                    }
                    match self.bus.accept_licenses(&remember) {
                        Ok(true) => info!("Licenses accepted for good: {:?}", remember),
                        Ok(false) => warn!("Daemon refused licenses {:?}", remember),
                        Err(e) => warn!("Failed to send accepted licenses: {}", e),
                    }
                }
                true
            }
        }
    }

    fn spawn_flow<F>(self: &Arc<Self>, name: &str, flow: F) -> Result<FlowHandle<Result<FlowOutcome>>>
    where
        F: FnOnce(&Inner) -> Result<FlowOutcome> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let name_owned = name.to_string();
        self.workers.spawn(name, move || {
            let outcome = flow(&inner);
            match &outcome {
                Ok(outcome) => debug!("{} finished: {:?}", name_owned, outcome),
                Err(e) => warn!("{} failed: {}", name_owned, e),
            }
            outcome
        })
    }
}

impl Inner {
    /// Run a daemon-triggered task that reports nothing back
    fn spawn_task<F>(self: &Arc<Self>, name: &str, task: F) -> Result<()>
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(self);
        self.workers.spawn(name, move || task(&inner)).map(drop)
    }
}

/// Client-side coordinator, one per process
#[derive(Clone)]
pub struct ServiceController {
    inner: Arc<Inner>,
}

impl ServiceController {
    pub fn builder(bus: Arc<dyn DaemonBus>, ui: UiHandle) -> ControllerBuilder {
        ControllerBuilder::new(bus, ui)
    }

    /// Synchronize `repositories` (all of them when empty)
    pub fn update_repositories(
        &self,
        repositories: Vec<String>,
        force: bool,
    ) -> Result<FlowHandle<Result<FlowOutcome>>> {
        self.inner.spawn_flow("update-repositories", move |inner| {
            repositories::run(inner, &repositories, force, Role::Master)
        })
    }

    /// Install or remove one application
    pub fn application_request(
        &self,
        app: AppRef,
        action: AppAction,
        simulate: bool,
    ) -> Result<FlowHandle<Result<FlowOutcome>>> {
        self.inner.spawn_flow("application-request", move |inner| {
            applications::request(inner, &app, action, simulate)
        })
    }

    pub fn upgrade_system(&self, simulate: bool) -> Result<FlowHandle<Result<FlowOutcome>>> {
        self.inner.spawn_flow("upgrade-system", move |inner| {
            upgrade::run(inner, simulate, Role::Master)
        })
    }

    /// Whether the daemon answers at all
    pub fn service_available(&self) -> bool {
        match self.inner.bus.api() {
            Ok(_) => true,
            Err(e) => {
                debug!("daemon not available: {}", e);
                false
            }
        }
    }

    /// Daemon API version, if this client supports it
    pub fn check_api(&self) -> Result<u32> {
        let api = self.inner.bus.api()?;
        if self.inner.supported_apis.contains(&api) {
            Ok(api)
        } else {
            Err(Error::UnsupportedApi {
                found: api,
                supported: self.inner.supported_apis.clone(),
            })
        }
    }

    pub fn supported_apis(&self) -> &[u32] {
        &self.inner.supported_apis
    }

    pub fn bus(&self) -> &Arc<dyn DaemonBus> {
        &self.inner.bus
    }

    pub fn local_activity(&self) -> LocalActivity {
        self.inner.activity.current()
    }

    /// Whether this process holds its shared resources lock
    pub fn resources_locked(&self) -> bool {
        self.inner.locker.is_locked()
    }

    /// Application the daemon is working on, its sub-state and progress
    pub fn get_transaction_state(&self) -> TransactionState {
        self.inner.tracker.state()
    }

    pub fn transaction_history(&self) -> Vec<ApplicationTransaction> {
        self.inner.tracker.history()
    }

    /// Held by repository updates; take it to read repositories safely
    pub fn repositories_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.repositories.lock()
    }

    /// Prompts waiting for the user
    pub fn pending_prompts(&self) -> usize {
        self.inner.checkpoints.pending()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.workers.active()
    }

    /// Stop listening, abandon pending requests and join every worker
    ///
    /// Never waits on the UI thread: events that no longer fit the queue
    /// are dropped and prompts resolve to their default answer.
    pub fn shutdown(&self) {
        info!("Shutting down service controller");
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.ui.close();

        let subscriptions: Vec<_> = self.inner.subscriptions.lock().drain(..).collect();
        for id in subscriptions {
            self.inner.bus.unsubscribe(id);
        }

        let aborted = self.inner.registry.abort_all();
        let cancelled = self.inner.checkpoints.cancel_all();
        debug!("aborted {} requests, cancelled {} prompts", aborted, cancelled);

        self.inner.workers.join_all();
        self.inner.please_wait(false);
    }
}

/// Assembles a [`ServiceController`]
pub struct ControllerBuilder {
    bus: Arc<dyn DaemonBus>,
    ui: UiHandle,
    catalog: Arc<dyn PackageCatalog>,
    resources: Option<Arc<dyn LocalResources>>,
    resource_lock: Box<dyn ResourceLock>,
    initially_locked: bool,
    licenses: LicenseStore,
    supported_apis: Vec<u32>,
    notification_timeout: Duration,
}

impl ControllerBuilder {
    pub fn new(bus: Arc<dyn DaemonBus>, ui: UiHandle) -> Self {
        Self {
            bus,
            ui,
            catalog: Arc::new(StaticCatalog::new()),
            resources: None,
            resource_lock: Box::new(FileResourceLock::new(FileResourceLock::DEFAULT_PATH)),
            initially_locked: false,
            licenses: LicenseStore::in_memory(),
            supported_apis: vec![0],
            notification_timeout: Duration::from_secs(10),
        }
    }

    /// Builder preloaded from a client configuration
    pub fn from_config(config: &ClientConfig, bus: Arc<dyn DaemonBus>, ui: UiHandle) -> Result<Self> {
        let licenses = match &config.licenses.store_path {
            Some(path) => LicenseStore::load(path)?,
            None => LicenseStore::in_memory(),
        };
        Ok(Self::new(bus, ui)
            .resource_lock(
                Box::new(FileResourceLock::new(&config.resources.lock_path)),
                config.resources.initially_locked,
            )
            .resources(Arc::new(RepositoryHandles::new(
                &config.resources.repositories_dir,
            )))
            .licenses(licenses)
            .supported_apis(config.daemon.supported_apis.clone())
            .notification_timeout(config.notification_timeout()))
    }

    pub fn catalog(mut self, catalog: Arc<dyn PackageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn resources(mut self, resources: Arc<dyn LocalResources>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Lock backing the shared hold; `locked` takes it during `build()`
    pub fn resource_lock(mut self, lock: Box<dyn ResourceLock>, locked: bool) -> Self {
        self.resource_lock = lock;
        self.initially_locked = locked;
        self
    }

    pub fn licenses(mut self, licenses: LicenseStore) -> Self {
        self.licenses = licenses;
        self
    }

    pub fn supported_apis(mut self, apis: Vec<u32>) -> Self {
        self.supported_apis = apis;
        self
    }

    pub fn notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Create the controller and subscribe it to daemon notifications
    pub fn build(self) -> Result<ServiceController> {
        let locker = SharedLocker::new(self.resource_lock, false);
        if self.initially_locked {
            locker.lock()?;
        }

        let activity = ActivityState::new();
        let ui = self.ui.clone();
        activity.observe(Box::new(move |current| {
            ui.post(UiEvent::ActivityChanged(current));
        }));

        let inner = Arc::new(Inner {
            bus: self.bus,
            activity,
            barrier: ActivityBarrier::new(),
            locker,
            registry: SignalRegistry::new(),
            checkpoints: CheckpointBridge::new(self.ui.clone(), self.licenses),
            catalog: self.catalog,
            resources: self.resources,
            ui: self.ui,
            tracker: TransactionTracker::new(),
            please_wait: Mutex::new(false),
            application_request: Mutex::new(()),
            repositories: Mutex::new(()),
            workers: Workers::new(),
            subscriptions: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            supported_apis: self.supported_apis,
            notification_timeout: self.notification_timeout,
        });

        let subscriptions = signals::subscribe_all(&inner);
        debug!("controller subscribed to {} notifications", subscriptions.len());
        *inner.subscriptions.lock() = subscriptions;

        Ok(ServiceController { inner })
    }
}

// tests/coordination.rs

//! Multi-client coordination: master/slave roles, shared lock handoff,
//! completion deduplication and checkpoint cancellation.

mod common;

use common::{CountingLock, TIMEOUT, catalog, client, client_with_catalog, wait_until};
use pkgmux::bus::LoopbackDaemon;
use pkgmux::catalog::{
    CatalogEntry, Installability, LicenseMap, PackageCatalog, Removability, StaticCatalog,
};
use pkgmux::checkpoint::LicenseStore;
use pkgmux::ui;
use pkgmux::{
    ActivityError, ActivityState, AppAction, AppRef, DaemonActivity, FlowOutcome, LocalActivity,
    ServiceController, SharedLocker, Signal, SignalKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_rejected_client_becomes_slave_and_converges() {
    let daemon = Arc::new(LoopbackDaemon::new());
    daemon.script("enqueue_application_action", true);
    daemon.script("enqueue_application_action", false);

    let a = client(&daemon, catalog());
    let b = client(&daemon, catalog());
    let app = AppRef::new(1, "main");

    let flow_a = a
        .controller
        .application_request(app.clone(), AppAction::Install, false)
        .unwrap();
    let flow_b = b
        .controller
        .application_request(app, AppAction::Install, false)
        .unwrap();

    assert!(daemon.wait_for_calls("enqueue_application_action", 2, TIMEOUT));
    let ready = |c: &common::Client| c.controller.local_activity() == LocalActivity::Ready;
    assert!(wait_until(TIMEOUT, || ready(&a) != ready(&b)));
    let (master, slave, master_flow, slave_flow) = if ready(&b) {
        (&a, &b, flow_a, flow_b)
    } else {
        (&b, &a, flow_b, flow_a)
    };
    assert_eq!(slave_flow.outcome().unwrap(), FlowOutcome::Rejected);

    // The daemon starts the master's batch and asks every client to step aside
    daemon.emit(Signal::ResourcesUnlockRequest {
        activity: DaemonActivity::ManagingApplications,
    });
    assert_eq!(master.lock.releases(), 1);
    assert!(wait_until(TIMEOUT, || {
        slave.controller.local_activity() == LocalActivity::ManagingApplications
    }));
    assert!(wait_until(TIMEOUT, || {
        daemon.subscriber_count(SignalKind::ApplicationsManaged) == 2
    }));
    assert_eq!(slave.lock.releases(), 0);

    daemon.emit(Signal::ApplicationsManaged { success: true });
    assert!(master_flow.outcome().unwrap().is_success());
    assert!(wait_until(TIMEOUT, || ready(slave) && slave.lock.releases() == 1));

    assert_eq!(daemon.call_count("enqueue_application_action"), 2);
    assert!(wait_until(TIMEOUT, || {
        slave.ui.log().managed == vec![(true, LocalActivity::ManagingApplications)]
    }));
}

#[test]
fn test_slave_unlocks_only_after_completion() {
    let daemon = Arc::new(LoopbackDaemon::new());
    daemon.set_activity(DaemonActivity::UpdatingRepositories);
    let client = client(&daemon, catalog());
    assert!(client.controller.resources_locked());

    daemon.emit(Signal::ResourcesUnlockRequest {
        activity: DaemonActivity::UpdatingRepositories,
    });
    assert!(wait_until(TIMEOUT, || {
        daemon.subscriber_count(SignalKind::RepositoriesUpdated) == 1
    }));
    assert_eq!(
        client.controller.local_activity(),
        LocalActivity::UpdatingRepositories
    );

    thread::sleep(Duration::from_millis(50));
    assert!(client.controller.resources_locked());
    assert_eq!(client.lock.releases(), 0);
    assert_eq!(daemon.call_count("update_repositories"), 0);

    daemon.emit(Signal::RepositoriesUpdated {
        result: 0,
        message: String::new(),
    });
    assert!(wait_until(TIMEOUT, || client.lock.releases() == 1));
    assert!(wait_until(TIMEOUT, || {
        client.controller.local_activity() == LocalActivity::Ready
    }));
    assert!(!client.controller.resources_locked());

    // Daemon is done and hands the resources back
    daemon.emit(Signal::ResourcesLockRequest {
        activity: DaemonActivity::UpdatingRepositories,
    });
    assert!(wait_until(TIMEOUT, || client.lock.acquires() == 2));
    assert!(client.controller.resources_locked());
    assert!(wait_until(TIMEOUT, || {
        client.ui.log().repositories_updated.len() == 1
    }));
}

#[test]
fn test_slave_reconciles_finished_activity() {
    let daemon = Arc::new(LoopbackDaemon::new());
    // The other client's upgrade finished before we looked
    daemon.set_activity(DaemonActivity::Idle);
    let client = client(&daemon, catalog());

    daemon.emit(Signal::ResourcesUnlockRequest {
        activity: DaemonActivity::UpgradingSystem,
    });
    assert!(wait_until(TIMEOUT, || client.lock.releases() == 1));
    assert!(wait_until(TIMEOUT, || {
        client.ui.log().managed == vec![(true, LocalActivity::UpgradingSystem)]
    }));
    assert_eq!(client.controller.local_activity(), LocalActivity::Ready);
    assert_eq!(daemon.subscriber_count(SignalKind::ApplicationsManaged), 0);
}

#[test]
fn test_completion_fires_once_under_race() {
    let daemon = Arc::new(LoopbackDaemon::new());
    let client = client(&daemon, catalog());
    const ROUNDS: usize = 25;

    for round in 0..ROUNDS {
        daemon.set_activity(DaemonActivity::Idle);
        let emitter = {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || {
                daemon.emit(Signal::ResourcesUnlockRequest {
                    activity: DaemonActivity::ManagingApplications,
                });
                daemon.emit(Signal::ApplicationsManaged { success: false });
            })
        };
        emitter.join().unwrap();

        assert!(wait_until(TIMEOUT, || {
            client.ui.log().managed.len() == round + 1
                && client.controller.local_activity() == LocalActivity::Ready
        }));
    }

    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.ui.log().managed.len(), ROUNDS);
    assert_eq!(daemon.subscriber_count(SignalKind::ApplicationsManaged), 0);
}

#[test]
fn test_lock_request_waits_for_open_span() {
    let daemon = Arc::new(LoopbackDaemon::new());
    let client = client(&daemon, catalog());
    assert_eq!(client.lock.acquires(), 1);

    let flow = client
        .controller
        .update_repositories(Vec::new(), false)
        .unwrap();
    assert!(daemon.wait_for_calls("update_repositories", 1, TIMEOUT));
    daemon.emit(Signal::ResourcesUnlockRequest {
        activity: DaemonActivity::UpdatingRepositories,
    });
    assert_eq!(client.lock.releases(), 1);

    // Completion and lock request race; the lock waits for the span
    daemon.emit(Signal::ResourcesLockRequest {
        activity: DaemonActivity::UpdatingRepositories,
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.lock.acquires(), 1);

    daemon.emit(Signal::RepositoriesUpdated {
        result: 0,
        message: String::new(),
    });
    assert!(flow.outcome().unwrap().is_success());
    assert!(wait_until(TIMEOUT, || client.lock.acquires() == 2));

    // Repeated requests collapse into the single hold
    for _ in 0..5 {
        daemon.emit(Signal::ResourcesLockRequest {
            activity: DaemonActivity::UpdatingRepositories,
        });
    }
    assert!(wait_until(TIMEOUT, || client.controller.active_workers() == 0));
    assert_eq!(client.lock.acquires(), 2);
}

#[test]
fn test_unanswered_prompt_released_by_shutdown() {
    let daemon = Arc::new(LoopbackDaemon::new());
    let catalog = catalog().with_entry(
        AppRef::new(5, "main"),
        CatalogEntry {
            name: "editor".into(),
            removal_warning: Some("Really remove editor?".into()),
            ..Default::default()
        },
    );
    let client = client(&daemon, catalog);
    client.ui.hold_prompts(true);

    let flow = client
        .controller
        .application_request(AppRef::new(5, "main"), AppAction::Remove, false)
        .unwrap();
    assert!(wait_until(TIMEOUT, || client.ui.held_prompts() == 1));
    assert_eq!(client.controller.pending_prompts(), 1);

    client.controller.shutdown();
    assert_eq!(flow.outcome().unwrap(), FlowOutcome::Declined);
    assert_eq!(client.controller.local_activity(), LocalActivity::Ready);
    assert_eq!(daemon.call_count("enqueue_application_action"), 0);
}

/// Catalog whose removal check parks until the test releases it.
struct GatedCatalog {
    inner: StaticCatalog,
    entered: flume::Sender<()>,
    release: flume::Receiver<()>,
}

impl PackageCatalog for GatedCatalog {
    fn name(&self, app: &AppRef) -> String {
        self.inner.name(app)
    }

    fn removability(&self, app: &AppRef) -> Removability {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        self.inner.removability(app)
    }

    fn installability(&self, app: &AppRef) -> Installability {
        self.inner.installability(app)
    }

    fn install_conflicts(&self, app: &AppRef) -> Vec<AppRef> {
        self.inner.install_conflicts(app)
    }

    fn upgrade_licenses(&self) -> LicenseMap {
        self.inner.upgrade_licenses()
    }

    fn installed_repository(&self) -> String {
        self.inner.installed_repository()
    }
}

#[test]
fn test_checkpoint_reached_during_shutdown_resolves() {
    let daemon = Arc::new(LoopbackDaemon::new());
    let (entered_tx, entered_rx) = flume::unbounded();
    let (release_tx, release_rx) = flume::unbounded();
    let gated = GatedCatalog {
        inner: catalog().with_entry(
            AppRef::new(5, "main"),
            CatalogEntry {
                name: "editor".into(),
                removal_warning: Some("Really remove editor?".into()),
                ..Default::default()
            },
        ),
        entered: entered_tx,
        release: release_rx,
    };
    let client = client_with_catalog(&daemon, Arc::new(gated), LicenseStore::in_memory());
    client.ui.hold_prompts(true);

    let flow = client
        .controller
        .application_request(AppRef::new(5, "main"), AppAction::Remove, false)
        .unwrap();
    entered_rx.recv_timeout(TIMEOUT).unwrap();

    let (done_tx, done_rx) = flume::bounded(1);
    let stopping = client.controller.clone();
    thread::spawn(move || {
        stopping.shutdown();
        let _ = done_tx.send(());
    });
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();

    assert!(done_rx.recv_timeout(TIMEOUT).is_ok(), "shutdown hung");
    assert_eq!(flow.outcome().unwrap(), FlowOutcome::Declined);
    assert_eq!(client.controller.pending_prompts(), 0);
    assert_eq!(client.controller.local_activity(), LocalActivity::Ready);
    assert_eq!(daemon.call_count("enqueue_application_action"), 0);
}

#[test]
fn test_shutdown_does_not_wait_for_undrained_ui() {
    let daemon = Arc::new(LoopbackDaemon::new());
    daemon.set_activity(DaemonActivity::UpdatingRepositories);
    let (handle, ui_loop) = ui::channel(1);
    let lock = CountingLock::default();
    let controller = ServiceController::builder(daemon.clone(), handle.clone())
        .catalog(Arc::new(catalog()))
        .resource_lock(Box::new(lock.clone()), true)
        .build()
        .unwrap();

    // Nobody drains the queue, so the observing flow parks on a full one
    daemon.emit(Signal::ResourcesUnlockRequest {
        activity: DaemonActivity::UpdatingRepositories,
    });
    assert!(wait_until(TIMEOUT, || {
        handle.backlog() == 1 && controller.active_workers() == 1
    }));
    thread::sleep(Duration::from_millis(100));

    let (done_tx, done_rx) = flume::bounded(1);
    let stopping = controller.clone();
    thread::spawn(move || {
        stopping.shutdown();
        let _ = done_tx.send(());
    });

    assert!(done_rx.recv_timeout(TIMEOUT).is_ok(), "shutdown hung");
    assert!(handle.is_closed());
    assert_eq!(controller.active_workers(), 0);
    assert_eq!(controller.local_activity(), LocalActivity::Ready);
    assert_eq!(lock.releases(), 1);
    drop(ui_loop);
}

#[test]
fn test_concurrent_busy_admits_one_holder() {
    let state = Arc::new(ActivityState::new());
    let holders = Arc::new(AtomicUsize::new(0));
    let activities = [
        LocalActivity::UpdatingRepositories,
        LocalActivity::ManagingApplications,
        LocalActivity::UpgradingSystem,
    ];

    let handles: Vec<_> = (0..9)
        .map(|i| {
            let state = Arc::clone(&state);
            let holders = Arc::clone(&holders);
            let activity = activities[i % activities.len()];
            thread::spawn(move || {
                for _ in 0..500 {
                    match state.busy(activity) {
                        Ok(()) => {
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(state.current(), activity);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            state.unbusy(activity).unwrap();
                        }
                        Err(ActivityError::Busy { current }) => {
                            assert_ne!(current, LocalActivity::Ready)
                        }
                        Err(ActivityError::SameActivity(current)) => {
                            assert_eq!(current, activity)
                        }
                        Err(other) => panic!("unexpected {:?}", other),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(state.current(), LocalActivity::Ready);
}

#[test]
fn test_concurrent_lock_unlock_transitions() {
    let lock = CountingLock::default();
    let locker = Arc::new(SharedLocker::new(Box::new(lock.clone()), false));

    let lockers: Vec<_> = (0..8)
        .map(|_| {
            let locker = Arc::clone(&locker);
            thread::spawn(move || locker.lock().unwrap())
        })
        .collect();
    for handle in lockers {
        handle.join().unwrap();
    }
    assert_eq!(lock.acquires(), 1);

    let unlockers: Vec<_> = (0..8)
        .map(|_| {
            let locker = Arc::clone(&locker);
            thread::spawn(move || locker.unlock().unwrap())
        })
        .collect();
    for handle in unlockers {
        handle.join().unwrap();
    }
    assert_eq!(lock.releases(), 1);
    assert!(!locker.is_locked());
}

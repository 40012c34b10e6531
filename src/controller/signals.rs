// src/controller/signals.rs

//! Daemon notification handling
//!
//! Every notification the daemon broadcasts lands here, on the bus
//! delivery thread. Handlers only update local bookkeeping and post UI
//! events; anything that may block (taking the shared lock, observing
//! another client's activity) is moved onto a named worker.

use super::{Inner, applications, repositories, upgrade};
use crate::activity::{DaemonActivity, LocalActivity};
use crate::bus::{AppRef, Signal, SignalKind, SubscriptionId};
use crate::output::{format_output, format_transfer};
use crate::registry::Role;
use crate::ui::{Notification, UiEvent};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Restart notices stay up longer than the usual notifications
const RESTART_NOTICE_TIMEOUT: Duration = Duration::from_secs(20);

type Handler = fn(&Arc<Inner>, &Signal);

const HANDLERS: &[(SignalKind, Handler)] = &[
    (SignalKind::Ping, on_ping),
    (SignalKind::Output, on_output),
    (SignalKind::TransferOutput, on_transfer_output),
    (SignalKind::ResourcesLockRequest, on_resources_lock_request),
    (SignalKind::ResourcesUnlockRequest, on_resources_unlock_request),
    (SignalKind::ActivityStarted, on_activity_started),
    (SignalKind::ActivityProgress, on_activity_progress),
    (SignalKind::ActivityCompleted, on_activity_completed),
    (SignalKind::ProcessingApplication, on_processing_application),
    (SignalKind::ApplicationProcessingUpdate, on_processing_update),
    (SignalKind::ApplicationProcessed, on_application_processed),
    (SignalKind::UnsupportedApplications, on_unsupported_applications),
    (SignalKind::RestartingSystemUpgrade, on_restarting_system_upgrade),
];

/// Subscribe the controller to every notification it handles
///
/// Handlers hold a weak reference so the bus never keeps a dropped
/// controller alive.
pub(super) fn subscribe_all(inner: &Arc<Inner>) -> Vec<SubscriptionId> {
    HANDLERS
        .iter()
        .map(|&(kind, handler)| {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            inner.bus.subscribe(
                kind,
                Arc::new(move |signal| {
                    if let Some(inner) = weak.upgrade() {
                        handler(&inner, signal);
                    }
                }),
            )
        })
        .collect()
}

fn on_ping(inner: &Arc<Inner>, _signal: &Signal) {
    if let Err(e) = inner.bus.pong() {
        warn!("Failed to answer daemon ping: {}", e);
    }
}

fn on_output(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::Output(line) = signal {
        inner.post(UiEvent::Terminal(format_output(line)));
    }
}

fn on_transfer_output(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::TransferOutput {
        average,
        downloaded,
        total,
        rate,
        eta,
    } = signal
    {
        let (fraction, text) = format_transfer(*average, *downloaded, *total, *rate, eta);
        inner.post(UiEvent::Progress { fraction, text });
    }
}

/// The daemon finished an activity and wants our shared hold back
fn on_resources_lock_request(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::ResourcesLockRequest { activity } = signal else {
        return;
    };
    let clear_views = !matches!(
        activity,
        DaemonActivity::ManagingApplications | DaemonActivity::UpgradingSystem
    );
    info!("Daemon requests resources lock after {}", activity);

    let spawned = inner.spawn_task("resources-lock", move |inner| {
        // Never reorder before an open span gives its hold back
        let _read = inner.barrier.read();
        match inner.locker.lock() {
            Ok(()) => inner.release_local_resources(clear_views),
            Err(e) => warn!("Cannot take shared resources lock: {}", e),
        }
    });
    if let Err(e) = spawned {
        warn!("Cannot schedule resources lock: {}", e);
    }
}

/// The daemon is about to run `activity` and wants our shared hold
fn on_resources_unlock_request(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::ResourcesUnlockRequest { activity } = signal else {
        return;
    };
    let Some(requested) = activity.local_activity() else {
        debug!("unlock request without an activity, ignoring");
        return;
    };
    let local = inner.activity.current();

    if local == LocalActivity::Ready {
        info!("Another client started {}, observing", requested);
        let spawned = match requested {
            LocalActivity::UpdatingRepositories => inner
                .spawn_flow("update-repositories", |inner| {
                    repositories::run(inner, &[], false, Role::Slave)
                })
                .map(drop),
            LocalActivity::ManagingApplications => inner
                .spawn_flow("application-request", applications::observe)
                .map(drop),
            LocalActivity::UpgradingSystem => inner
                .spawn_flow("upgrade-system", |inner| upgrade::run(inner, false, Role::Slave))
                .map(drop),
            LocalActivity::Ready => Ok(()),
        };
        if let Err(e) = spawned {
            warn!("Cannot observe {}: {}", requested, e);
            inner.release_hold();
        }
        return;
    }

    if local != requested {
        debug!("not accepting unlock request for {} while {}", requested, local);
        return;
    }

    // Our own request was accepted
    match requested {
        LocalActivity::UpdatingRepositories => inner.release_local_resources(true),
        LocalActivity::ManagingApplications => inner.release_local_resources(false),
        _ => {}
    }
    inner.release_hold();
}

fn on_activity_started(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::ActivityStarted { activity } = signal {
        debug!("daemon started {}", activity);
    }
    inner.tracker.reset();
    inner.please_wait(false);
}

fn on_activity_progress(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::ActivityProgress { percent, .. } = signal
        && inner.tracker.activity_progress(*percent)
    {
        inner.post(UiEvent::Progress {
            fraction: f64::from((*percent).min(100)) / 100.0,
            text: None,
        });
    }
}

fn on_activity_completed(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::ActivityCompleted { activity, success } = signal {
        debug!("daemon completed {} (success: {})", activity, success);
    }
    inner.tracker.reset();
}

fn on_processing_application(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::ProcessingApplication {
        package_id,
        repository_id,
        action,
        tx_state,
    } = signal
    else {
        return;
    };
    let app = AppRef::new(*package_id, repository_id.clone());
    let name = inner.catalog.name(&app);
    inner
        .tracker
        .processing(app.clone(), name.clone(), *action, *tx_state);
    inner.post(UiEvent::ApplicationProcessing {
        app,
        name,
        action: *action,
    });
}

fn on_processing_update(inner: &Arc<Inner>, signal: &Signal) {
    if let Signal::ApplicationProcessingUpdate {
        package_id,
        repository_id,
        tx_state,
        progress,
    } = signal
    {
        let app = AppRef::new(*package_id, repository_id.clone());
        inner.tracker.update(&app, *tx_state, *progress);
    }
}

fn on_application_processed(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::ApplicationProcessed {
        package_id,
        repository_id,
        action,
        outcome,
    } = signal
    else {
        return;
    };
    let app = AppRef::new(*package_id, repository_id.clone());
    let name = inner.catalog.name(&app);
    inner.tracker.processed(&app, name.clone(), *action, *outcome);

    if let Some(reason) = outcome.reason(&name) {
        warn!("{} of {} failed: {}", action, app, outcome);
        inner.ui.notify(Notification::error(reason).with_log());
    }
    inner.post(UiEvent::ApplicationProcessed {
        app,
        name,
        action: *action,
        outcome: *outcome,
    });
}

fn on_unsupported_applications(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::UnsupportedApplications { manual_ids, ids } = signal else {
        return;
    };
    if manual_ids.is_empty() && ids.is_empty() {
        return;
    }
    let installed = inner.catalog.installed_repository();
    let resolve = |ids: &[i64]| -> Vec<AppRef> {
        ids.iter()
            .map(|id| AppRef::new(*id, installed.clone()))
            .collect()
    };
    inner.post(UiEvent::UnsupportedApplications {
        manual: resolve(manual_ids.as_slice()),
        apps: resolve(ids.as_slice()),
    });
}

fn on_restarting_system_upgrade(inner: &Arc<Inner>, signal: &Signal) {
    let Signal::RestartingSystemUpgrade { pending_count } = signal else {
        return;
    };
    let pending = if *pending_count == 1 {
        "There is 1 more update".to_string()
    } else {
        format!("There are {} more updates", pending_count)
    };
    inner.ui.notify(
        Notification::info(format!(
            "System Upgrade Activity is being restarted. {}",
            pending
        ))
        .with_timeout(RESTART_NOTICE_TIMEOUT),
    );
}

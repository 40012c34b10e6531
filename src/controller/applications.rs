// src/controller/applications.rs

//! Application Request flow
//!
//! Install and remove requests share one daemon activity: the first
//! accepted request opens it and every later request while it runs is
//! appended to the daemon's queue. Locally the first request opens the
//! activity span; later ones hit `SameActivity` and only run their
//! checkpoints and enqueue, leaving completion to the running span.

use super::{FlowOutcome, Inner};
use crate::Result;
use crate::activity::{ActivityError, LocalActivity};
use crate::bus::{AppAction, AppRef, Signal, SignalKind};
use crate::catalog::{Installability, Removability};
use crate::registry::{PendingRequest, Resolution, Role};
use crate::ui::UiEvent;
use tracing::{debug, info};

const ACTIVITY: LocalActivity = LocalActivity::ManagingApplications;

/// Master flow for one install or remove request
pub(super) fn request(
    inner: &Inner,
    app: &AppRef,
    action: AppAction,
    simulate: bool,
) -> Result<FlowOutcome> {
    let serial = inner.application_request.lock();

    let span = match inner.open_span(ACTIVITY) {
        Ok(span) => Some(span),
        Err(ActivityError::SameActivity(_)) => {
            debug!("{} joins the running application batch", app);
            None
        }
        Err(e) => {
            info!("Cannot {} {}: {}", action, app, e);
            inner.notify_in_progress();
            return Ok(FlowOutcome::Busy);
        }
    };

    if !checks(inner, app, action) {
        info!("{} of {} declined", action, app);
        inner.post(UiEvent::ApplicationAbort {
            app: app.clone(),
            action,
        });
        return Ok(FlowOutcome::Declined);
    }

    let armed = span.as_ref().map(|_| {
        inner.begin_work(ACTIVITY, false, Role::Master);
        let request = PendingRequest::new(SignalKind::ApplicationsManaged, Role::Master);
        let subscription = inner
            .registry
            .arm(inner.bus.as_ref(), &request, applications_managed);
        inner.guard_shutdown(&request);
        (request, subscription)
    });

    let accepted = inner.bus.enqueue_application_action(app, action, simulate);
    let accepted = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            if let Some((request, subscription)) = &armed {
                inner.unwind_request(request, *subscription);
            }
            return Err(e);
        }
    };
    if !accepted {
        info!("Daemon rejected {} of {}", action, app);
        if let Some((request, subscription)) = &armed {
            inner.unwind_request(request, *subscription);
        }
        inner.notify_in_progress();
        inner.post(UiEvent::ApplicationAbort {
            app: app.clone(),
            action,
        });
        return Ok(FlowOutcome::Rejected);
    }

    notify_enqueued(inner, app);
    drop(serial);

    let Some((request, subscription)) = armed else {
        return Ok(FlowOutcome::Enqueued);
    };

    let resolution = inner.await_completion(&request, subscription, false);
    drop(span);
    Ok(finish(inner, resolution))
}

/// Slave flow: another client's application batch is running
pub(super) fn observe(inner: &Inner) -> Result<FlowOutcome> {
    let span = match inner.open_span(ACTIVITY) {
        Ok(span) => span,
        Err(e) => {
            info!("Cannot observe application batch: {}", e);
            inner.release_hold();
            return Ok(FlowOutcome::Busy);
        }
    };

    inner.begin_work(ACTIVITY, false, Role::Slave);
    let request = PendingRequest::new(SignalKind::ApplicationsManaged, Role::Slave);
    let subscription = inner
        .registry
        .arm(inner.bus.as_ref(), &request, applications_managed);
    inner.guard_shutdown(&request);
    inner.reconcile(&request, ACTIVITY, true);

    let resolution = inner.await_completion(&request, subscription, false);
    inner.release_hold();
    drop(span);
    Ok(finish(inner, resolution))
}

pub(super) fn applications_managed(signal: &Signal) -> Option<bool> {
    match signal {
        Signal::ApplicationsManaged { success } => Some(*success),
        _ => None,
    }
}

fn finish(inner: &Inner, resolution: Resolution<bool>) -> FlowOutcome {
    match resolution {
        Resolution::Completed(success) => {
            info!("Applications managed, success: {}", success);
            inner.post(UiEvent::ApplicationsManaged {
                success,
                activity: ACTIVITY,
            });
            FlowOutcome::Completed {
                success,
                message: None,
            }
        }
        Resolution::Aborted => FlowOutcome::Cancelled,
    }
}

/// Checkpoints before anything reaches the daemon; `false` stops the flow
fn checks(inner: &Inner, app: &AppRef, action: AppAction) -> bool {
    if inner.is_closing() {
        debug!("shutting down, not asking about {}", app);
        return false;
    }
    let name = inner.catalog.name(app);
    match action {
        AppAction::Remove => match inner.catalog.removability(app) {
            Removability::Removable => true,
            Removability::NeedsConfirmation(reason) => inner.checkpoints.confirm(reason),
            Removability::NotRemovable => {
                inner.checkpoints.acknowledge_error(format!(
                    "{}\nis part of the Base System and cannot be removed",
                    name
                ));
                false
            }
        },
        AppAction::Install => {
            match inner.catalog.installability(app) {
                Installability::Installable => {}
                Installability::NeedsLicenses(licenses) => {
                    if !inner.license_checks(&licenses) {
                        return false;
                    }
                }
                Installability::Unsatisfiable => {
                    inner.checkpoints.acknowledge_error(format!(
                        "{}\ncannot be installed at this time due to \
                         missing/masked dependencies or dependency conflict",
                        name
                    ));
                    return false;
                }
            }

            let conflicts = inner.catalog.install_conflicts(app);
            if conflicts.is_empty() {
                return true;
            }
            let names: Vec<String> = conflicts.iter().map(|c| inner.catalog.name(c)).collect();
            inner.checkpoints.confirm(format!(
                "Installing {} would cause the removal of the following Applications: {}",
                name,
                names.join(", ")
            ))
        }
    }
}

fn notify_enqueued(inner: &Inner, app: &AppRef) {
    let mut message = format!("{} action enqueued", inner.catalog.name(app));
    match inner.bus.action_queue_length() {
        Ok(queued) if queued > 0 => {
            message.push_str(&format!(
                ", {} Application(s) enqueued so far...",
                queued
            ));
        }
        Ok(_) => {}
        Err(e) => debug!("cannot read action queue length: {}", e),
    }
    inner.notify_timed(message);
}

// src/controller/upgrade.rs

//! Upgrade System flow

use super::applications::applications_managed;
use super::{FlowOutcome, Inner};
use crate::Result;
use crate::activity::LocalActivity;
use crate::bus::SignalKind;
use crate::registry::{PendingRequest, Resolution, Role};
use crate::ui::UiEvent;
use tracing::info;

const ACTIVITY: LocalActivity = LocalActivity::UpgradingSystem;

pub(super) fn run(inner: &Inner, simulate: bool, role: Role) -> Result<FlowOutcome> {
    let span = match inner.open_span(ACTIVITY) {
        Ok(span) => span,
        Err(e) => {
            info!("Cannot upgrade the system: {}", e);
            match role {
                Role::Master => inner.notify_in_progress(),
                Role::Slave => inner.release_hold(),
            }
            return Ok(FlowOutcome::Busy);
        }
    };

    if role == Role::Master && !inner.license_checks(&inner.catalog.upgrade_licenses()) {
        info!("System upgrade declined");
        return Ok(FlowOutcome::Declined);
    }

    inner.begin_work(ACTIVITY, false, role);
    let request = PendingRequest::new(SignalKind::ApplicationsManaged, role);
    let subscription = inner
        .registry
        .arm(inner.bus.as_ref(), &request, applications_managed);
    inner.guard_shutdown(&request);

    match role {
        Role::Master => {
            info!("Requesting system upgrade (simulate: {})", simulate);
            match inner.bus.upgrade_system(simulate) {
                Ok(true) => {
                    inner.notify_timed("System Upgrade has begun, now go make some coffee".into());
                }
                Ok(false) => {
                    info!("Daemon rejected system upgrade");
                    inner.unwind_request(&request, subscription);
                    inner.notify_in_progress();
                    return Ok(FlowOutcome::Rejected);
                }
                Err(e) => {
                    inner.unwind_request(&request, subscription);
                    return Err(e);
                }
            }
        }
        Role::Slave => inner.reconcile(&request, ACTIVITY, true),
    }

    let resolution = inner.await_completion(&request, subscription, true);
    if role == Role::Slave {
        inner.release_hold();
    }
    drop(span);

    match resolution {
        Resolution::Completed(success) => {
            info!("System upgrade finished, success: {}", success);
            inner.post(UiEvent::ApplicationsManaged {
                success,
                activity: ACTIVITY,
            });
            Ok(FlowOutcome::Completed {
                success,
                message: None,
            })
        }
        Resolution::Aborted => Ok(FlowOutcome::Cancelled),
    }
}

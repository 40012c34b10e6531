// src/controller/repositories.rs

//! Update Repositories flow

use super::{FlowOutcome, Inner};
use crate::Result;
use crate::activity::{ActivityError, LocalActivity};
use crate::bus::{Signal, SignalKind};
use crate::registry::{PendingRequest, Resolution, Role};
use crate::ui::UiEvent;
use tracing::info;

const ACTIVITY: LocalActivity = LocalActivity::UpdatingRepositories;

pub(super) fn run(
    inner: &Inner,
    repositories: &[String],
    force: bool,
    role: Role,
) -> Result<FlowOutcome> {
    let span = match inner.open_span(ACTIVITY) {
        Ok(span) => span,
        Err(e) => return Ok(refused(inner, e, role)),
    };
    let sync_guard = inner.repositories.lock();

    inner.begin_work(ACTIVITY, true, role);

    let request = PendingRequest::new(SignalKind::RepositoriesUpdated, role);
    let subscription = inner.registry.arm(inner.bus.as_ref(), &request, |signal| match signal {
        Signal::RepositoriesUpdated { result, message } => Some((*result, message.clone())),
        _ => None,
    });
    inner.guard_shutdown(&request);

    match role {
        Role::Master => {
            info!("Updating repositories {:?} (force: {})", repositories, force);
            match inner.bus.update_repositories(repositories, force) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Daemon rejected repositories update");
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
        Role::Slave => inner.reconcile(&request, ACTIVITY, (0, String::new())),
    }

    let resolution = inner.await_completion(&request, subscription, true);
    if role == Role::Slave {
        inner.release_hold();
    }
    drop(sync_guard);
    drop(span);

    match resolution {
        Resolution::Completed((result, message)) => {
            info!("Repositories updated: result {} {}", result, message);
            inner.post(UiEvent::RepositoriesUpdated {
                result,
                message: message.clone(),
            });
            Ok(FlowOutcome::Completed {
                success: result == 0,
                message: (!message.is_empty()).then_some(message),
            })
        }
        Resolution::Aborted => Ok(FlowOutcome::Cancelled),
    }
}

/// `busy()` failed before anything was sent
fn refused(inner: &Inner, error: ActivityError, role: Role) -> FlowOutcome {
    info!("Cannot update repositories: {}", error);
    match role {
        Role::Master => inner.notify_in_progress(),
        Role::Slave => inner.release_hold(),
    }
    FlowOutcome::Busy
}

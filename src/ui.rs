// src/ui.rs

//! Delivery of controller events to the UI thread
//!
//! Worker threads and bus handlers never touch the UI directly. They post
//! [`UiEvent`]s through a [`UiHandle`] into a bounded queue, and the thread
//! owning the [`UiLoop`] drains it, so every event is handled exactly once
//! and always on that thread.
//!
//! A full queue blocks the poster until [`UiHandle::close`] is called. After
//! that, events that do not fit are dropped instead, so shutdown never waits
//! on a UI thread that stopped draining.

use crate::activity::LocalActivity;
use crate::bus::{AppAction, AppRef, AppTransactionOutcome};
use crate::checkpoint::PromptRequest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Non-blocking message for the user
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    /// Offers a dismiss button
    pub dismissible: bool,
    /// Offers to show the detailed work log
    pub show_log: bool,
    /// Auto-hide after this long
    pub timeout: Option<Duration>,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            dismissible: false,
            show_log: false,
            timeout: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn dismissible(mut self) -> Self {
        self.dismissible = true;
        self
    }

    pub fn with_log(mut self) -> Self {
        self.show_log = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Event delivered to the UI thread
#[derive(Debug)]
pub enum UiEvent {
    /// Local activity changed
    ActivityChanged(LocalActivity),
    /// A flow started; `lock_ui` asks to switch to the work view
    StartWorking {
        activity: LocalActivity,
        lock_ui: bool,
    },
    /// Show or hide the "waiting for the daemon" indicator
    PleaseWait(bool),
    Notify(Notification),
    /// Drop every non-managed notification
    NotificationsCleared,
    /// A checkpoint waiting for an answer
    Prompt(PromptRequest),
    /// Formatted daemon output for the terminal
    Terminal(String),
    TerminalReset,
    Progress {
        fraction: f64,
        text: Option<String>,
    },
    ProgressReset,
    ApplicationProcessing {
        app: AppRef,
        name: String,
        action: AppAction,
    },
    ApplicationProcessed {
        app: AppRef,
        name: String,
        action: AppAction,
        outcome: AppTransactionOutcome,
    },
    /// A checkpoint stopped the request before it reached the daemon
    ApplicationAbort {
        app: AppRef,
        action: AppAction,
    },
    ApplicationsManaged {
        success: bool,
        activity: LocalActivity,
    },
    RepositoriesUpdated {
        result: i32,
        message: String,
    },
    UnsupportedApplications {
        manual: Vec<AppRef>,
        apps: Vec<AppRef>,
    },
    /// Cached application views were invalidated
    ViewsCleared,
}

/// How often a blocked post re-checks for `close()`
const POST_RETRY: Duration = Duration::from_millis(50);

/// Sending side, cloned into every worker
#[derive(Clone)]
pub struct UiHandle {
    tx: flume::Sender<UiEvent>,
    closed: Arc<AtomicBool>,
}

impl UiHandle {
    /// Queue an event; blocks while the queue is full, until closed
    ///
    /// Returns `false` if the event was dropped because the UI loop is gone
    /// or the handle was closed with the queue full. Dropping an event
    /// resolves any prompt it carries to its default answer.
    pub fn post(&self, event: UiEvent) -> bool {
        let mut event = event;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return match self.tx.try_send(event) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("UI closed, dropping {:?}", e.into_inner());
                        false
                    }
                };
            }
            match self.tx.send_timeout(event, POST_RETRY) {
                Ok(()) => return true,
                Err(flume::SendTimeoutError::Timeout(back)) => event = back,
                Err(flume::SendTimeoutError::Disconnected(back)) => {
                    debug!("UI loop gone, dropping {:?}", back);
                    return false;
                }
            }
        }
    }

    /// Stop waiting for queue space; shared by every clone
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn notify(&self, notification: Notification) -> bool {
        self.post(UiEvent::Notify(notification))
    }

    /// Events waiting to be handled
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

/// Receiving side, owned by the UI thread
pub struct UiLoop {
    rx: flume::Receiver<UiEvent>,
}

impl UiLoop {
    /// Handle every queued event without blocking
    pub fn drain<F: FnMut(UiEvent)>(&self, mut handler: F) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            handler(event);
            handled += 1;
        }
        handled
    }

    /// Handle events until `done()` holds and the queue is empty
    pub fn run_until<F, D>(&self, mut handler: F, done: D)
    where
        F: FnMut(UiEvent),
        D: Fn() -> bool,
    {
        loop {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => handler(event),
                Err(flume::RecvTimeoutError::Timeout) => {
                    if done() {
                        self.drain(&mut handler);
                        return;
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<UiEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Create a connected handle/loop pair with room for `capacity` events
pub fn channel(capacity: usize) -> (UiHandle, UiLoop) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let handle = UiHandle {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    (handle, UiLoop { rx })
}

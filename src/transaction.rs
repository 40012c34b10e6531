// src/transaction.rs

//! Per-application transaction tracking
//!
//! The daemon reports each application it works on with three
//! notifications: processing started, progress updates, processed. The
//! tracker mirrors the application currently in flight so the UI can ask
//! for its state at any time, and keeps the finished ones for display.

use crate::bus::{AppAction, AppRef, AppTransactionOutcome, AppTransactionState, TransactionPhase};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Finished transactions kept for display
const HISTORY_LIMIT: usize = 64;

/// One application the daemon is working on or has finished
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationTransaction {
    pub app: AppRef,
    pub name: String,
    pub action: AppAction,
    pub state: Option<AppTransactionState>,
    /// 0..=100, or -1 when unknown
    pub progress: i32,
    pub outcome: Option<AppTransactionOutcome>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationTransaction {
    fn new(app: AppRef, name: String, action: AppAction) -> Self {
        let now = Utc::now();
        Self {
            app,
            name,
            action,
            state: None,
            progress: 0,
            outcome: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot returned by [`TransactionTracker::state`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionState {
    pub app: Option<AppRef>,
    pub state: Option<AppTransactionState>,
    pub progress: i32,
}

#[derive(Default)]
struct TrackerState {
    current: Option<ApplicationTransaction>,
    phase: Option<TransactionPhase>,
    activity_progress: u32,
    history: VecDeque<ApplicationTransaction>,
}

/// Mirror of the daemon's application transaction state
#[derive(Default)]
pub struct TransactionTracker {
    inner: Mutex<TrackerState>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the in-flight application (activity started or completed)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.current = None;
        inner.phase = None;
        inner.activity_progress = 0;
    }

    /// The daemon started working on `app`
    pub fn processing(&self, app: AppRef, name: String, action: AppAction, phase: TransactionPhase) {
        let mut inner = self.inner.lock();
        inner.phase = Some(phase);
        inner.current = Some(ApplicationTransaction::new(app, name, action));
    }

    /// Progress update for `app`
    pub fn update(&self, app: &AppRef, state: AppTransactionState, progress: u32) {
        let mut inner = self.inner.lock();
        let progress = progress.min(100) as i32;
        if let Some(tx) = inner.current.as_mut().filter(|tx| &tx.app == app) {
            tx.state = Some(state);
            tx.progress = progress;
            tx.updated_at = Utc::now();
            return;
        }

        // Update for an application we never saw start
        let mut tx = ApplicationTransaction::new(app.clone(), app.to_string(), AppAction::Install);
        tx.state = Some(state);
        tx.progress = progress;
        inner.current = Some(tx);
    }

    /// The daemon finished `app`; returns the completed record
    pub fn processed(
        &self,
        app: &AppRef,
        name: String,
        action: AppAction,
        outcome: AppTransactionOutcome,
    ) -> ApplicationTransaction {
        let mut inner = self.inner.lock();
        let mut tx = match inner.current.take() {
            Some(tx) if &tx.app == app => tx,
            _ => ApplicationTransaction::new(app.clone(), name, action),
        };
        tx.action = action;
        tx.state = Some(AppTransactionState::Processed);
        tx.progress = if outcome.is_success() { 100 } else { -1 };
        tx.outcome = Some(outcome);
        tx.updated_at = Utc::now();

        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(tx.clone());
        tx
    }

    /// Record activity progress; returns whether it should drive the
    /// progress bar (only while the current application is being managed)
    pub fn activity_progress(&self, percent: u32) -> bool {
        let mut inner = self.inner.lock();
        inner.activity_progress = percent.min(100);
        inner.phase == Some(TransactionPhase::Manage)
    }

    pub fn last_activity_progress(&self) -> u32 {
        self.inner.lock().activity_progress
    }

    /// Current application, its sub-state and progress
    ///
    /// Without an application there is no state; without a state there is
    /// no application. Progress is -1 in both cases.
    pub fn state(&self) -> TransactionState {
        let inner = self.inner.lock();
        let app = inner.current.as_ref().map(|tx| tx.app.clone());
        let state = inner.current.as_ref().and_then(|tx| tx.state);
        let progress = inner.current.as_ref().map_or(-1, |tx| tx.progress);

        match (app, state) {
            (Some(app), Some(state)) => TransactionState {
                app: Some(app),
                state: Some(state),
                progress,
            },
            _ => TransactionState {
                app: None,
                state: None,
                progress: -1,
            },
        }
    }

    /// Finished transactions, oldest first
    pub fn history(&self) -> Vec<ApplicationTransaction> {
        self.inner.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_rules() {
        let tracker = TransactionTracker::new();
        let app = AppRef::new(7, "main");

        let empty = tracker.state();
        assert_eq!(empty.app, None);
        assert_eq!(empty.progress, -1);

        tracker.processing(app.clone(), "foo".into(), AppAction::Install, TransactionPhase::Download);
        // Started but no sub-state yet
        assert_eq!(tracker.state().app, None);
        assert_eq!(tracker.state().progress, -1);

        tracker.update(&app, AppTransactionState::Processing, 40);
        let state = tracker.state();
        assert_eq!(state.app, Some(app.clone()));
        assert_eq!(state.state, Some(AppTransactionState::Processing));
        assert_eq!(state.progress, 40);
    }

    #[test]
    fn test_processed_moves_to_history() {
        let tracker = TransactionTracker::new();
        let app = AppRef::new(7, "main");
        tracker.processing(app.clone(), "foo".into(), AppAction::Remove, TransactionPhase::Manage);
        tracker.update(&app, AppTransactionState::Processing, 90);

        let done = tracker.processed(
            &app,
            "foo".into(),
            AppAction::Remove,
            AppTransactionOutcome::RemoveError,
        );
        assert_eq!(done.outcome, Some(AppTransactionOutcome::RemoveError));
        assert_eq!(done.progress, -1);
        assert_eq!(done.name, "foo");
        assert_eq!(tracker.state().app, None);
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_activity_progress_forwarded_only_when_managing() {
        let tracker = TransactionTracker::new();
        let app = AppRef::new(1, "main");
        assert!(!tracker.activity_progress(10));

        tracker.processing(app.clone(), "foo".into(), AppAction::Install, TransactionPhase::Download);
        assert!(!tracker.activity_progress(20));

        tracker.processing(app, "foo".into(), AppAction::Install, TransactionPhase::Manage);
        assert!(tracker.activity_progress(30));
        assert_eq!(tracker.last_activity_progress(), 30);

        tracker.reset();
        assert!(!tracker.activity_progress(40));
    }
}

// src/activity.rs

//! Local activity state machine
//!
//! Each client process commits to at most one long-running activity at a
//! time. `busy()` and `unbusy()` are compare-and-set transitions performed
//! under a dedicated mutex; `current()` is a lock-free snapshot so the UI
//! thread can read it at any time without contending with workers.
//!
//! ```text
//!            busy(x)                 unbusy(x)
//!  READY ─────────────► x ─────────────────────► READY
//!            │                        │
//!            ├ current == x  → SameActivity
//!            └ current != READY → Busy
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::debug;

/// Activity this client has locally committed to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LocalActivity {
    /// No activity in progress
    Ready,
    /// Repository synchronization
    UpdatingRepositories,
    /// Application install/remove batch
    ManagingApplications,
    /// Full system upgrade
    UpgradingSystem,
}

impl LocalActivity {
    /// The daemon-side activity this local activity waits on
    pub fn daemon_activity(self) -> DaemonActivity {
        match self {
            LocalActivity::Ready => DaemonActivity::Idle,
            LocalActivity::UpdatingRepositories => DaemonActivity::UpdatingRepositories,
            LocalActivity::ManagingApplications => DaemonActivity::ManagingApplications,
            LocalActivity::UpgradingSystem => DaemonActivity::UpgradingSystem,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LocalActivity::Ready => 0,
            LocalActivity::UpdatingRepositories => 1,
            LocalActivity::ManagingApplications => 2,
            LocalActivity::UpgradingSystem => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LocalActivity::UpdatingRepositories,
            2 => LocalActivity::ManagingApplications,
            3 => LocalActivity::UpgradingSystem,
            _ => LocalActivity::Ready,
        }
    }
}

/// Activity as reported by the daemon
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DaemonActivity {
    /// Daemon is not running any activity
    Idle,
    UpdatingRepositories,
    ManagingApplications,
    UpgradingSystem,
}

impl DaemonActivity {
    /// Local activity mirroring this daemon activity, if any
    pub fn local_activity(self) -> Option<LocalActivity> {
        match self {
            DaemonActivity::Idle => None,
            DaemonActivity::UpdatingRepositories => Some(LocalActivity::UpdatingRepositories),
            DaemonActivity::ManagingApplications => Some(LocalActivity::ManagingApplications),
            DaemonActivity::UpgradingSystem => Some(LocalActivity::UpgradingSystem),
        }
    }
}

/// Local activity contention errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityError {
    #[error("Activity '{0}' is already in progress")]
    SameActivity(LocalActivity),

    #[error("Another activity is in progress: '{current}'")]
    Busy { current: LocalActivity },

    #[error("Cannot leave '{requested}' while '{current}' is in progress")]
    WrongActivity {
        requested: LocalActivity,
        current: LocalActivity,
    },

    #[error("No activity in progress")]
    AlreadyReady,
}

impl ActivityError {
    /// `Busy` and `SameActivity` come from a concurrent request;
    /// the other two indicate a bookkeeping bug.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            ActivityError::Busy { .. } | ActivityError::SameActivity(_)
        )
    }
}

/// Callback invoked on every committed transition
pub type ActivityObserver = Box<dyn Fn(LocalActivity) + Send + Sync>;

/// Single-process activity state
pub struct ActivityState {
    /// Serializes transitions
    transition: Mutex<()>,
    /// Current value, readable without the mutex
    current: AtomicU8,
    observers: Mutex<Vec<ActivityObserver>>,
}

impl ActivityState {
    /// Create a state starting at `Ready`
    pub fn new() -> Self {
        Self {
            transition: Mutex::new(()),
            current: AtomicU8::new(LocalActivity::Ready.to_u8()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer for committed transitions
    pub fn observe(&self, observer: ActivityObserver) {
        self.observers.lock().push(observer);
    }

    /// Switch from `Ready` to `activity`
    pub fn busy(&self, activity: LocalActivity) -> Result<(), ActivityError> {
        let _guard = self.transition.lock();
        let current = self.current();
        if current == activity {
            return Err(ActivityError::SameActivity(activity));
        }
        if current != LocalActivity::Ready {
            return Err(ActivityError::Busy { current });
        }
        self.commit(activity);
        debug!("local activity: ready -> {}", activity);
        Ok(())
    }

    /// Switch from `activity` back to `Ready`
    pub fn unbusy(&self, activity: LocalActivity) -> Result<(), ActivityError> {
        let _guard = self.transition.lock();
        let current = self.current();
        if current == LocalActivity::Ready {
            return Err(ActivityError::AlreadyReady);
        }
        if current != activity {
            return Err(ActivityError::WrongActivity {
                requested: activity,
                current,
            });
        }
        self.commit(LocalActivity::Ready);
        debug!("local activity: {} -> ready", activity);
        Ok(())
    }

    /// Snapshot of the current activity
    pub fn current(&self) -> LocalActivity {
        LocalActivity::from_u8(self.current.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.current() == LocalActivity::Ready
    }

    // Called with the transition mutex held so observers see transitions in order.
    fn commit(&self, activity: LocalActivity) {
        self.current.store(activity.to_u8(), Ordering::Release);
        for observer in self.observers.lock().iter() {
            observer(activity);
        }
    }
}

impl Default for ActivityState {
    fn default() -> Self {
        Self::new()
    }
}

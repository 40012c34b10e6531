// src/bus/mod.rs

//! IPC bus to the privileged package daemon
//!
//! The daemon exposes a small set of method calls and broadcasts
//! notifications to every connected client. Method calls either answer a
//! query or return whether the daemon accepted the request; the work itself
//! is reported later through notifications.
//!
//! # Transports
//!
//! - [`socket::SocketBus`]: newline-delimited JSON over a Unix socket
//! - [`loopback::LoopbackDaemon`]: in-process daemon stand-in
//!
//! # Wire shapes
//!
//! ```text
//! call:   {"method":"upgrade_system","params":{"simulate":false}}
//! reply:  {"type":"accepted","value":true}
//! signal: {"name":"applications_managed","args":{"success":true}}
//! ```

pub mod hub;
pub mod loopback;
pub mod socket;

pub use hub::{SignalHandler, SignalHub, SubscriptionId};
pub use loopback::LoopbackDaemon;
pub use socket::SocketBus;

use crate::activity::DaemonActivity;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumDiscriminants, IntoStaticStr};

/// Daemon-side package identifier
pub type PackageId = i64;

/// Identifies one application: a package inside a repository
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppRef {
    pub package_id: PackageId,
    pub repository_id: String,
}

impl AppRef {
    pub fn new(package_id: PackageId, repository_id: impl Into<String>) -> Self {
        Self {
            package_id,
            repository_id: repository_id.into(),
        }
    }
}

impl std::fmt::Display for AppRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.package_id, self.repository_id)
    }
}

/// Application action the daemon can enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppAction {
    Install,
    Remove,
}

/// Phase of the application the daemon is currently working on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionPhase {
    /// Fetching package files; progress goes to the transfer bar
    Download,
    /// Installing or removing; activity progress drives the bar
    Manage,
}

/// Sub-state of an application transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppTransactionState {
    None,
    Queued,
    Processing,
    Processed,
}

/// Terminal outcome reported by `application_processed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AppTransactionOutcome {
    Success,
    DownloadError,
    InstallError,
    RemoveError,
    PermissionDenied,
    InternalError,
    DependenciesNotFound,
    DependenciesCollision,
    DependenciesNotRemovable,
}

impl AppTransactionOutcome {
    pub fn is_success(self) -> bool {
        self == AppTransactionOutcome::Success
    }

    /// Human-readable failure reason for application `name`
    pub fn reason(self, name: &str) -> Option<String> {
        let reason = match self {
            AppTransactionOutcome::Success => return None,
            AppTransactionOutcome::DownloadError => format!("{name} download failed"),
            AppTransactionOutcome::InstallError => format!("{name} install failed"),
            AppTransactionOutcome::RemoveError => format!("{name} removal failed"),
            AppTransactionOutcome::PermissionDenied => format!("{name}, not authorized"),
            AppTransactionOutcome::InternalError => format!("{name}, internal error"),
            AppTransactionOutcome::DependenciesNotFound => {
                format!("{name} dependencies not found")
            }
            AppTransactionOutcome::DependenciesCollision => {
                format!("{name} dependencies collision error")
            }
            AppTransactionOutcome::DependenciesNotRemovable => {
                format!("{name} dependencies not removable error")
            }
        };
        Some(reason)
    }
}

/// Severity of a daemon output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// Payload of the `output` notification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLine {
    pub text: String,
    pub header: String,
    pub footer: String,
    /// Overwrite the current line instead of starting a new one
    pub back: bool,
    pub importance: u8,
    pub level: OutputLevel,
    pub count_current: u64,
    pub count_total: u64,
    /// Render the counter as a percentage
    pub percent: bool,
    /// Pass `text` through unformatted
    pub raw: bool,
}

/// Client to daemon method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Call {
    UpdateRepositories {
        repositories: Vec<String>,
        force: bool,
    },
    EnqueueApplicationAction {
        package_id: PackageId,
        repository_id: String,
        action: AppAction,
        simulate: bool,
    },
    UpgradeSystem {
        simulate: bool,
    },
    AcceptLicenses {
        license_ids: Vec<String>,
    },
    Pong,
    Activity,
    ActionQueueLength,
    Action {
        package_id: PackageId,
        repository_id: String,
    },
    Exclusive,
    Api,
}

impl Call {
    /// Method name used on the wire and in logs
    pub fn method(&self) -> &'static str {
        self.into()
    }
}

/// Daemon answer to a [`Call`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// Request accepted or rejected
    Accepted(bool),
    Activity(DaemonActivity),
    Count(u32),
    /// Queued action for an application, if any
    Action(Option<AppAction>),
    Exclusive(bool),
    Api(u32),
    /// Fire-and-forget call delivered
    Ack,
}

/// Daemon to client notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
#[strum_discriminants(name(SignalKind), derive(Hash))]
pub enum Signal {
    /// Keepalive; answer with `pong()`
    Ping,
    Output(OutputLine),
    TransferOutput {
        /// Overall percentage
        average: u32,
        /// Bytes downloaded so far
        downloaded: u64,
        /// Total size in kB
        total: f64,
        /// Transfer rate in bytes per second
        rate: u64,
        eta: String,
    },
    ResourcesLockRequest {
        activity: DaemonActivity,
    },
    ResourcesUnlockRequest {
        activity: DaemonActivity,
    },
    ActivityStarted {
        activity: DaemonActivity,
    },
    ActivityProgress {
        activity: DaemonActivity,
        percent: u32,
    },
    ActivityCompleted {
        activity: DaemonActivity,
        success: bool,
    },
    ProcessingApplication {
        package_id: PackageId,
        repository_id: String,
        action: AppAction,
        tx_state: TransactionPhase,
    },
    ApplicationProcessingUpdate {
        package_id: PackageId,
        repository_id: String,
        tx_state: AppTransactionState,
        progress: u32,
    },
    ApplicationProcessed {
        package_id: PackageId,
        repository_id: String,
        action: AppAction,
        outcome: AppTransactionOutcome,
    },
    ApplicationsManaged {
        success: bool,
    },
    RepositoriesUpdated {
        result: i32,
        message: String,
    },
    UnsupportedApplications {
        manual_ids: Vec<PackageId>,
        ids: Vec<PackageId>,
    },
    RestartingSystemUpgrade {
        pending_count: u32,
    },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        SignalKind::from(self)
    }
}

/// Connection to the daemon
///
/// Implementations route [`Call`]s to the daemon and deliver every
/// notification to the handlers subscribed for its kind. Handlers run on a
/// transport-owned thread and may issue calls themselves.
pub trait DaemonBus: Send + Sync {
    /// Perform one method call and wait for its reply
    fn call(&self, call: Call) -> Result<Reply>;

    /// Deliver notifications of `kind` to `handler`
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId;

    /// Remove a subscription; returns whether it existed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Ask the daemon to synchronize `repositories` (all when empty)
    fn update_repositories(&self, repositories: &[String], force: bool) -> Result<bool> {
        accepted(self.call(Call::UpdateRepositories {
            repositories: repositories.to_vec(),
            force,
        })?)
    }

    fn enqueue_application_action(
        &self,
        app: &AppRef,
        action: AppAction,
        simulate: bool,
    ) -> Result<bool> {
        accepted(self.call(Call::EnqueueApplicationAction {
            package_id: app.package_id,
            repository_id: app.repository_id.clone(),
            action,
            simulate,
        })?)
    }

    fn upgrade_system(&self, simulate: bool) -> Result<bool> {
        accepted(self.call(Call::UpgradeSystem { simulate })?)
    }

    fn accept_licenses(&self, license_ids: &[String]) -> Result<bool> {
        accepted(self.call(Call::AcceptLicenses {
            license_ids: license_ids.to_vec(),
        })?)
    }

    fn pong(&self) -> Result<()> {
        match self.call(Call::Pong)? {
            Reply::Ack | Reply::Accepted(_) => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    fn activity(&self) -> Result<DaemonActivity> {
        match self.call(Call::Activity)? {
            Reply::Activity(activity) => Ok(activity),
            other => Err(unexpected("activity", &other)),
        }
    }

    fn action_queue_length(&self) -> Result<u32> {
        match self.call(Call::ActionQueueLength)? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected("action_queue_length", &other)),
        }
    }

    fn action(&self, app: &AppRef) -> Result<Option<AppAction>> {
        match self.call(Call::Action {
            package_id: app.package_id,
            repository_id: app.repository_id.clone(),
        })? {
            Reply::Action(action) => Ok(action),
            other => Err(unexpected("action", &other)),
        }
    }

    fn exclusive(&self) -> Result<bool> {
        match self.call(Call::Exclusive)? {
            Reply::Exclusive(exclusive) => Ok(exclusive),
            other => Err(unexpected("exclusive", &other)),
        }
    }

    fn api(&self) -> Result<u32> {
        match self.call(Call::Api)? {
            Reply::Api(version) => Ok(version),
            other => Err(unexpected("api", &other)),
        }
    }
}

fn accepted(reply: Reply) -> Result<bool> {
    match reply {
        Reply::Accepted(accepted) => Ok(accepted),
        other => Err(unexpected("request", &other)),
    }
}

fn unexpected(method: &str, reply: &Reply) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", method, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_wire_format() {
        let call = Call::UpgradeSystem { simulate: true };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["method"], "upgrade_system");
        assert_eq!(json["params"]["simulate"], true);
        assert_eq!(call.method(), "upgrade_system");

        let pong = serde_json::to_string(&Call::Pong).unwrap();
        assert_eq!(pong, r#"{"method":"pong"}"#);
    }

    #[test]
    fn test_signal_parse() {
        let signal: Signal = serde_json::from_str(
            r#"{"name":"repositories_updated","args":{"result":0,"message":"ok"}}"#,
        )
        .unwrap();
        assert_eq!(signal.kind(), SignalKind::RepositoriesUpdated);
        assert_eq!(
            signal,
            Signal::RepositoriesUpdated {
                result: 0,
                message: "ok".to_string()
            }
        );

        let ping: Signal = serde_json::from_str(r#"{"name":"ping"}"#).unwrap();
        assert_eq!(ping.kind(), SignalKind::Ping);
    }

    #[test]
    fn test_output_defaults() {
        let signal: Signal =
            serde_json::from_str(r#"{"name":"output","args":{"text":"hello"}}"#).unwrap();
        match signal {
            Signal::Output(line) => {
                assert_eq!(line.text, "hello");
                assert_eq!(line.level, OutputLevel::Info);
                assert!(!line.raw);
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_outcome_reasons() {
        assert_eq!(AppTransactionOutcome::Success.reason("foo"), None);
        assert_eq!(
            AppTransactionOutcome::PermissionDenied.reason("foo").unwrap(),
            "foo, not authorized"
        );
        assert_eq!(
            AppTransactionOutcome::DependenciesCollision
                .reason("foo")
                .unwrap(),
            "foo dependencies collision error"
        );
        let json = serde_json::to_string(&AppTransactionOutcome::DependenciesNotFound).unwrap();
        assert_eq!(json, r#""DEPENDENCIES_NOT_FOUND""#);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply: Reply = serde_json::from_str(r#"{"type":"accepted","value":false}"#).unwrap();
        assert_eq!(reply, Reply::Accepted(false));
        assert!(matches!(
            unexpected("api", &Reply::Ack),
            Error::Protocol(_)
        ));
    }
}

// src/config.rs
//! Client configuration file
//!
//! TOML file with the following sections, every field optional:
//! - [daemon] - Socket path, call timeout, supported API versions
//! - [resources] - Shared lock file, repository databases
//! - [licenses] - Where licenses accepted forever are stored
//! - [ui] - Event queue size, notification timeout
//! - [logging] - Default log level

use crate::bus::SocketBus;
use crate::locker::FileResourceLock;
use crate::resources::RepositoryHandles;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub resources: ResourcesSection,

    #[serde(default)]
    pub licenses: LicensesSection,

    #[serde(default)]
    pub ui: UiSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Connection to the privileged daemon
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Unix socket the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Seconds to wait for a reply to any call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Daemon API versions this client speaks
    #[serde(default = "default_supported_apis")]
    pub supported_apis: Vec<u32>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            call_timeout_secs: default_call_timeout(),
            supported_apis: default_supported_apis(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(SocketBus::DEFAULT_PATH)
}

fn default_call_timeout() -> u64 {
    30
}

fn default_supported_apis() -> Vec<u32> {
    vec![0]
}

/// Package resources shared with the daemon
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesSection {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Directory holding one SQLite database per repository
    #[serde(default = "default_repositories_dir")]
    pub repositories_dir: PathBuf,

    /// Whether the shared hold is taken at startup
    #[serde(default)]
    pub initially_locked: bool,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            repositories_dir: default_repositories_dir(),
            initially_locked: false,
        }
    }
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(FileResourceLock::DEFAULT_PATH)
}

fn default_repositories_dir() -> PathBuf {
    PathBuf::from(RepositoryHandles::DEFAULT_DIR)
}

/// License acceptance memory
#[derive(Debug, Clone, Deserialize)]
pub struct LicensesSection {
    /// JSON array of license ids accepted forever; none keeps them in memory
    #[serde(default = "default_store_path")]
    pub store_path: Option<PathBuf>,
}

impl Default for LicensesSection {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

fn default_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib/pkgmux/accepted-licenses.json"))
}

/// UI event delivery
#[derive(Debug, Clone, Deserialize)]
pub struct UiSection {
    /// Events buffered before posting blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_secs: u64,
}

impl Default for UiSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            notification_timeout_secs: default_notification_timeout(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_notification_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    pub const DEFAULT_PATH: &'static str = "/etc/pkgmux/client.toml";

    /// Load from `path`; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.supported_apis.is_empty() {
            return Err(Error::InvalidConfig(
                "daemon.supported_apis must not be empty".to_string(),
            ));
        }
        if self.daemon.call_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "daemon.call_timeout_secs must be positive".to_string(),
            ));
        }
        if self.ui.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "ui.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.call_timeout_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.ui.notification_timeout_secs)
    }

    /// Set the daemon socket path
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.daemon.socket_path = path.into();
        self
    }

    /// Set the shared lock file
    pub fn with_lock_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.resources.lock_path = path.into();
        self
    }

    pub fn with_repositories_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.resources.repositories_dir = path.into();
        self
    }

    /// Persist accepted licenses at `path`, or keep them in memory
    pub fn with_license_store(mut self, path: Option<PathBuf>) -> Self {
        self.licenses.store_path = path;
        self
    }

    pub fn with_supported_apis(mut self, apis: Vec<u32>) -> Self {
        self.daemon.supported_apis = apis;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.ui.queue_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.daemon.socket_path, PathBuf::from("/run/pkgmux/daemon.sock"));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.daemon.supported_apis, vec![0]);
        assert!(!config.resources.initially_locked);
        assert_eq!(config.ui.queue_capacity, 256);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ClientConfig::parse(
            r#"
[daemon]
socket_path = "/tmp/test.sock"
supported_apis = [0, 1]

[resources]
initially_locked = true

[logging]
level = "debug"
"#,
        )
        .unwrap();

        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.daemon.call_timeout_secs, 30);
        assert_eq!(config.daemon.supported_apis, vec![0, 1]);
        assert!(config.resources.initially_locked);
        assert_eq!(config.ui.notification_timeout_secs, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ClientConfig::parse("[daemon]\nsupported_apis = []\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            ClientConfig::parse("[ui]\nqueue_capacity = 0\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            ClientConfig::parse("[daemon]\nsocket_path = 5\n"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ui.queue_capacity, 256);

        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[ui]\nqueue_capacity = 8\n").unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap().ui.queue_capacity, 8);
    }

    #[test]
    fn test_builder_setters() {
        let config = ClientConfig::default()
            .with_socket_path("/tmp/a.sock")
            .with_lock_path("/tmp/a.lock")
            .with_license_store(None)
            .with_queue_capacity(4);
        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/a.sock"));
        assert_eq!(config.resources.lock_path, PathBuf::from("/tmp/a.lock"));
        assert!(config.licenses.store_path.is_none());
        assert_eq!(config.ui.queue_capacity, 4);
    }
}

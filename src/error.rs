// src/error.rs

//! Error types shared across the crate

use crate::activity::ActivityError;
use thiserror::Error;

/// Result alias used throughout pkgmux
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the client-side coordination layer
#[derive(Error, Debug)]
pub enum Error {
    /// Local activity contention (busy/unbusy misuse or a concurrent activity)
    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The daemon answered with something the protocol does not allow here
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The daemon reported a failure for a call
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// The bus connection is gone
    #[error("Daemon connection lost")]
    Disconnected,

    /// No reply within the configured call timeout
    #[error("Daemon call '{0}' timed out")]
    Timeout(&'static str),

    #[error("Daemon API version {found} is not supported (supported: {supported:?})")]
    UnsupportedApi { found: u32, supported: Vec<u32> },

    #[error("Lock error: {0}")]
    Lock(String),

    /// A worker thread ended without producing its result
    #[error("Worker '{0}' exited without a result")]
    WorkerLost(String),

    #[error("Controller is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Whether this error is local activity contention
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Activity(e) if e.is_contention())
    }
}

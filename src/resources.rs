// src/resources.rs

//! Local handles on shared package state
//!
//! The daemon rewrites the repository databases while it runs an activity.
//! Any SQLite handle the client keeps open would contend with it on file
//! locks, so flows release every local handle before waiting on the daemon
//! and again once completion is observed, picking up the new state lazily.

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Process-wide resources the daemon must not contend with
pub trait LocalResources: Send + Sync {
    /// Close every local handle
    fn release(&self) -> Result<()>;
}

/// Lazily opened read-only connections to per-repository databases
pub struct RepositoryHandles {
    dir: PathBuf,
    open: Mutex<HashMap<String, Connection>>,
}

impl RepositoryHandles {
    pub const DEFAULT_DIR: &'static str = "/var/lib/pkgmux/repositories";

    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Database file for a repository id
    pub fn database_path(&self, repository_id: &str) -> PathBuf {
        self.dir.join(format!("{}.db", repository_id))
    }

    /// Repository ids with a database file, sorted
    pub fn repositories(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "db")
                && let Some(stem) = path.file_stem()
            {
                ids.push(stem.to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Run `f` against the repository's database, opening it if needed
    pub fn with_repository<T, F>(&self, repository_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut open = self.open.lock();
        if !open.contains_key(repository_id) {
            let path = self.database_path(repository_id);
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            debug!("Opened repository database {:?}", path);
            open.insert(repository_id.to_string(), conn);
        }
        let conn = open
            .get(repository_id)
            .ok_or_else(|| crate::Error::Protocol(format!("repository {} vanished", repository_id)))?;
        f(conn)
    }

    /// Number of open connections
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Close all open connections
    pub fn close_all(&self) -> Result<()> {
        let handles: Vec<(String, Connection)> = self.open.lock().drain().collect();
        let mut first_error = None;
        for (id, conn) in handles {
            if let Err((_conn, e)) = conn.close() {
                warn!("Failed to close repository {}: {}", id, e);
                first_error.get_or_insert(e);
            } else {
                debug!("Closed repository database {}", id);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl LocalResources for RepositoryHandles {
    fn release(&self) -> Result<()> {
        self.close_all()
    }
}

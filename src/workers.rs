// src/workers.rs

//! Named worker threads with retained handles
//!
//! Every request flow and every daemon-triggered task runs on its own
//! named thread. The handle is kept so shutdown can join them all; a flow's
//! result travels back through a one-slot channel wrapped in [`FlowHandle`].

use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Result side of a spawned worker
pub struct FlowHandle<T> {
    name: String,
    rx: flume::Receiver<T>,
}

impl<T> FlowHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker finished (with or without a result)
    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty() || self.rx.is_disconnected()
    }

    /// Block until the worker produces its result
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::WorkerLost(self.name.clone()))
    }

    /// Block up to `timeout`; `None` if the worker is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(Ok(value)),
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => {
                Some(Err(Error::WorkerLost(self.name.clone())))
            }
        }
    }
}

impl<T> FlowHandle<Result<T>> {
    /// Wait and surface the worker's own error as well
    pub fn outcome(self) -> Result<T> {
        self.wait()?
    }
}

/// Registry of live worker threads
#[derive(Default)]
pub struct Workers {
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on a new thread called `name`
    pub fn spawn<T, F>(&self, name: &str, task: F) -> Result<FlowHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let (tx, rx) = flume::bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(task());
            })?;

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        debug!("spawned worker {} ({} live)", name, handles.len());

        Ok(FlowHandle {
            name: name.to_string(),
            rx,
        })
    }

    /// Workers not yet finished
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Refuse new workers and join every retained one
    pub fn join_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let current = thread::current().id();
        loop {
            let handles: Vec<_> = self.handles.lock().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                let name = handle.thread().name().unwrap_or("worker").to_string();
                if handle.join().is_err() {
                    error!("Worker {} panicked", name);
                }
            }
        }
    }
}

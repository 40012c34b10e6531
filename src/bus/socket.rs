// src/bus/socket.rs

//! Unix socket transport
//!
//! Frames are single JSON objects terminated by a newline.
//!
//! ```text
//! client -> daemon  {"id":7,"call":{"method":"api"}}
//! daemon -> client  {"kind":"reply","id":7,"result":{"type":"api","value":0}}
//!                   {"kind":"reply","id":8,"error":"not authorized"}
//!                   {"kind":"signal","signal":{"name":"ping"}}
//! ```
//!
//! A reader thread routes replies to the caller waiting on that id and hands
//! signals to a dispatch thread. Handlers therefore run off the reader and
//! may issue calls of their own (e.g. `pong()` from a `ping` handler).

use super::{Call, DaemonBus, Reply, Signal, SignalHandler, SignalHub, SignalKind, SubscriptionId};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ReplySender = flume::Sender<std::result::Result<Reply, String>>;
type PendingCalls = Arc<Mutex<HashMap<u64, ReplySender>>>;

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    call: &'a Call,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Inbound {
    Reply {
        id: u64,
        #[serde(default)]
        result: Option<Reply>,
        #[serde(default)]
        error: Option<String>,
    },
    Signal {
        signal: Signal,
    },
}

/// Bus connection over a Unix-domain socket
pub struct SocketBus {
    socket_path: PathBuf,
    stream: Mutex<UnixStream>,
    pending: PendingCalls,
    hub: Arc<SignalHub>,
    next_id: AtomicU64,
    timeout: Duration,
    connected: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketBus {
    /// Default daemon socket path
    pub const DEFAULT_PATH: &'static str = "/run/pkgmux/daemon.sock";

    /// Connect to the daemon socket and start the reader threads
    pub fn connect<P: AsRef<Path>>(socket_path: P, timeout: Duration) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path)?;
        let read_half = stream.try_clone()?;

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let hub = Arc::new(SignalHub::new());
        let connected = Arc::new(AtomicBool::new(true));
        let (signal_tx, signal_rx) = flume::unbounded::<Signal>();

        let reader = {
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            thread::Builder::new()
                .name("bus-reader".to_string())
                .spawn(move || read_loop(read_half, pending, signal_tx, connected))?
        };

        let dispatcher = {
            let hub = Arc::clone(&hub);
            thread::Builder::new()
                .name("bus-dispatch".to_string())
                .spawn(move || {
                    // Ends once the reader drops its sender
                    for signal in signal_rx.iter() {
                        hub.deliver(&signal);
                    }
                    debug!("bus dispatch thread stopped");
                })?
        };

        info!("Connected to daemon at {:?}", socket_path);

        Ok(Self {
            socket_path,
            stream: Mutex::new(stream),
            pending,
            hub,
            next_id: AtomicU64::new(1),
            timeout,
            connected,
            threads: Mutex::new(vec![reader, dispatcher]),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection and join the transport threads
    pub fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.stream.lock().shutdown(Shutdown::Both);
        }

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if let Err(e) = handle.join() {
                error!("Bus thread panicked: {:?}", e);
            }
        }
    }

    fn send(&self, id: u64, call: &Call) -> Result<()> {
        let mut line = serde_json::to_vec(&Request { id, call })?;
        line.push(b'\n');
        let mut stream = self.stream.lock();
        stream.write_all(&line)?;
        stream.flush()?;
        Ok(())
    }
}

impl DaemonBus for SocketBus {
    fn call(&self, call: Call) -> Result<Reply> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(1);
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.send(id, &call) {
            self.pending.lock().remove(&id);
            warn!("Failed to send {} to daemon: {}", call.method(), e);
            return Err(e);
        }
        debug!("-> {} (id {})", call.method(), id);

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(Error::Daemon(message)),
            Err(flume::RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(call.method()))
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        self.hub.subscribe(kind, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

impl Drop for SocketBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(
    stream: UnixStream,
    pending: PendingCalls,
    signals: flume::Sender<Signal>,
    connected: Arc<AtomicBool>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                if connected.load(Ordering::SeqCst) {
                    error!("Daemon connection read failed: {}", e);
                }
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Inbound>(&line) {
            Ok(Inbound::Reply { id, result, error }) => {
                let Some(tx) = pending.lock().remove(&id) else {
                    warn!("Dropping reply for unknown call id {}", id);
                    continue;
                };
                let outcome = match (result, error) {
                    (_, Some(message)) => Err(message),
                    (Some(reply), None) => Ok(reply),
                    (None, None) => Ok(Reply::Ack),
                };
                let _ = tx.send(outcome);
            }
            Ok(Inbound::Signal { signal }) => {
                if signals.send(signal).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Ignoring malformed frame from daemon: {}", e),
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call with Disconnected
    let in_flight = std::mem::take(&mut *pending.lock());
    if !in_flight.is_empty() {
        warn!("Daemon connection lost with {} call(s) in flight", in_flight.len());
    }
    debug!("bus reader thread stopped");
}

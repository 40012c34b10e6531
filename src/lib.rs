// src/lib.rs

//! pkgmux: client side of a shared package management daemon
//!
//! A privileged daemon owns the package database and runs the long
//! operations (repository sync, application install/remove, system
//! upgrade). Any number of unprivileged clients talk to it over an IPC bus.
//! This crate is the client half: it decides when a client may start an
//! activity, waits for the daemon to finish it, and keeps every client's
//! local view consistent with the daemon's.
//!
//! # Architecture
//!
//! - [`activity`]: per-process activity state machine (`busy`/`unbusy`)
//! - [`locker`]: idempotent shared hold on the package resources
//! - [`barrier`]: writer-preference gate around one activity span
//! - [`registry`]: fire-once completion across signal and polling paths
//! - [`checkpoint`]: blocking user prompts inside worker threads
//! - [`controller`]: the request flows and daemon notification handling
//! - [`bus`]: the daemon contract and its transports

pub mod activity;
pub mod barrier;
pub mod bus;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod controller;
mod error;
pub mod locker;
pub mod output;
pub mod registry;
pub mod resources;
pub mod sync;
pub mod transaction;
pub mod ui;
pub mod workers;

pub use activity::{ActivityError, ActivityState, DaemonActivity, LocalActivity};
pub use bus::{AppAction, AppRef, DaemonBus, LoopbackDaemon, Signal, SignalKind, SocketBus};
pub use catalog::{PackageCatalog, StaticCatalog};
pub use checkpoint::{Answer, LicenseStore, Prompt, PromptRequest};
pub use config::ClientConfig;
pub use controller::{ControllerBuilder, FlowOutcome, ServiceController};
pub use error::{Error, Result};
pub use locker::{FileResourceLock, ResourceLock, SharedLocker};
pub use transaction::{ApplicationTransaction, TransactionState};
pub use ui::{Notification, Severity, UiEvent, UiHandle, UiLoop};
pub use workers::FlowHandle;

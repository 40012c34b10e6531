// src/checkpoint.rs

//! Interactive checkpoints
//!
//! A checkpoint suspends a worker thread until the user answers a prompt
//! on the UI thread. The worker posts a [`PromptRequest`] carrying a
//! [`Responder`] and blocks on a semaphore; the UI resolves the responder,
//! which stores the answer and releases the worker.
//!
//! A prompt always resolves. Dismissing it, dropping the responder, losing
//! the UI loop, or cancelling the bridge all resolve it to its default
//! answer (`Declined`, or `Acknowledged` for error acknowledgements).

use crate::Result;
use crate::bus::AppRef;
use crate::catalog::LicenseMap;
use crate::sync::Semaphore;
use crate::ui::{UiEvent, UiHandle};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// What the user is asked
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Yes/no question
    Confirm { message: String },
    /// Accept one license for the listed applications
    License {
        license: String,
        applications: Vec<String>,
    },
    /// Informational, acknowledged with a single button
    Error { message: String },
}

/// User answer to a [`Prompt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Confirmed,
    Declined,
    /// License accepted, optionally for every future prompt
    Accepted { forever: bool },
    Acknowledged,
}

struct AnswerSlot {
    answer: Mutex<Option<Answer>>,
    ready: Semaphore,
    default: Answer,
}

impl AnswerSlot {
    fn new(default: Answer) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(None),
            ready: Semaphore::new(0),
            default,
        })
    }

    fn resolve(&self, answer: Answer) -> bool {
        let mut slot = self.answer.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(answer);
        self.ready.release();
        true
    }

    fn cancel(&self) -> bool {
        self.resolve(self.default)
    }

    fn wait(&self) -> Answer {
        self.ready.acquire();
        (*self.answer.lock()).unwrap_or(self.default)
    }
}

/// The UI's handle on one pending prompt
pub struct Responder {
    slot: Arc<AnswerSlot>,
}

impl Responder {
    /// Answer the prompt
    pub fn resolve(self, answer: Answer) {
        self.slot.resolve(answer);
    }

    /// Close the prompt without answering
    pub fn dismiss(self) {
        self.slot.cancel();
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.slot.cancel() {
            debug!("prompt dropped unanswered, resolved to {:?}", self.slot.default);
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("default", &self.slot.default)
            .finish()
    }
}

/// Prompt plus the responder the UI answers through
#[derive(Debug)]
pub struct PromptRequest {
    pub prompt: Prompt,
    pub responder: Responder,
}

/// Result of a license checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseDecision {
    /// Every license was already accepted for good
    NotNeeded,
    /// Accepted; `remember` lists the ids accepted forever
    Accepted { remember: Vec<String> },
    Declined,
}

/// License ids the user accepted forever
pub struct LicenseStore {
    path: Option<PathBuf>,
    accepted: Mutex<BTreeSet<String>>,
}

impl LicenseStore {
    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            accepted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Load the store from a JSON array file; missing file means empty
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let accepted = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path: Some(path),
            accepted: Mutex::new(accepted),
        })
    }

    pub fn contains(&self, license: &str) -> bool {
        self.accepted.lock().contains(license)
    }

    /// Record `licenses` as accepted forever and persist the store
    pub fn remember(&self, licenses: &[String]) -> Result<()> {
        let snapshot = {
            let mut accepted = self.accepted.lock();
            accepted.extend(licenses.iter().cloned());
            accepted.clone()
        };
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Blocking bridge between worker threads and UI prompts
pub struct CheckpointBridge {
    ui: UiHandle,
    licenses: LicenseStore,
    outstanding: Mutex<Outstanding>,
}

#[derive(Default)]
struct Outstanding {
    slots: Vec<Weak<AnswerSlot>>,
    /// Set by `cancel_all`; later prompts resolve to their default at once
    closed: bool,
}

impl Outstanding {
    fn prune(&mut self) {
        self.slots.retain(|slot| {
            slot.upgrade()
                .is_some_and(|slot| slot.answer.lock().is_none())
        });
    }
}

impl CheckpointBridge {
    pub fn new(ui: UiHandle, licenses: LicenseStore) -> Self {
        Self {
            ui,
            licenses,
            outstanding: Mutex::new(Outstanding::default()),
        }
    }

    pub fn licenses(&self) -> &LicenseStore {
        &self.licenses
    }

    /// Ask a yes/no question; `true` only on an explicit confirmation
    pub fn confirm(&self, message: impl Into<String>) -> bool {
        let answer = self.ask(
            Prompt::Confirm {
                message: message.into(),
            },
            Answer::Declined,
        );
        answer == Answer::Confirmed
    }

    /// Report a blocking error and wait until it is acknowledged
    pub fn acknowledge_error(&self, message: impl Into<String>) {
        self.ask(
            Prompt::Error {
                message: message.into(),
            },
            Answer::Acknowledged,
        );
    }

    /// Present one prompt per license not already accepted forever
    ///
    /// `name` resolves application names for display. Stops at the first
    /// declined license.
    pub fn license_checkpoint<N>(&self, map: &LicenseMap, name: N) -> LicenseDecision
    where
        N: Fn(&AppRef) -> String,
    {
        let mut asked = false;
        let mut remember = Vec::new();

        for (license, apps) in map {
            if self.licenses.contains(license) {
                debug!("license {} already accepted", license);
                continue;
            }
            asked = true;
            let answer = self.ask(
                Prompt::License {
                    license: license.clone(),
                    applications: apps.iter().map(&name).collect(),
                },
                Answer::Declined,
            );
            match answer {
                Answer::Accepted { forever } => {
                    if forever {
                        remember.push(license.clone());
                    }
                }
                _ => {
                    info!("License {} declined", license);
                    return LicenseDecision::Declined;
                }
            }
        }

        if asked {
            LicenseDecision::Accepted { remember }
        } else {
            LicenseDecision::NotNeeded
        }
    }

    /// Resolve every unanswered prompt to its default answer
    ///
    /// The bridge stays closed afterwards: later checkpoints are never
    /// shown and resolve to their default answer right away.
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<_> = {
            let mut outstanding = self.outstanding.lock();
            outstanding.closed = true;
            outstanding.slots.drain(..).collect()
        };
        slots
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|slot| slot.cancel())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.outstanding.lock().closed
    }

    /// Number of prompts waiting for an answer
    pub fn pending(&self) -> usize {
        let mut outstanding = self.outstanding.lock();
        outstanding.prune();
        outstanding.slots.len()
    }

    fn ask(&self, prompt: Prompt, default: Answer) -> Answer {
        let slot = AnswerSlot::new(default);
        {
            let mut outstanding = self.outstanding.lock();
            if outstanding.closed {
                debug!("checkpoint after cancellation, {:?}: {:?}", default, prompt);
                return default;
            }
            outstanding.prune();
            outstanding.slots.push(Arc::downgrade(&slot));
        }

        debug!("checkpoint: {:?}", prompt);
        let request = PromptRequest {
            prompt,
            responder: Responder {
                slot: Arc::clone(&slot),
            },
        };
        // A refused post drops the responder, which resolves the slot
        self.ui.post(UiEvent::Prompt(request));

        let answer = slot.wait();
        debug!("checkpoint answered: {:?}", answer);
        answer
    }
}

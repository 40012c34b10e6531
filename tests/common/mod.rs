// tests/common/mod.rs

//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use pkgmux::bus::LoopbackDaemon;
use pkgmux::catalog::{CatalogEntry, PackageCatalog, StaticCatalog};
use pkgmux::checkpoint::{Answer, LicenseStore, Prompt, Responder};
use pkgmux::resources::LocalResources;
use pkgmux::ui::{self, Notification, UiEvent};
use pkgmux::{AppRef, LocalActivity, ResourceLock, ServiceController};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Resource lock that only counts acquisitions and releases.
#[derive(Clone, Default)]
pub struct CountingLock {
    pub acquires: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
}

impl CountingLock {
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl ResourceLock for CountingLock {
    fn acquire_shared(&self) -> pkgmux::Result<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> pkgmux::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local resources that count how often they were released.
#[derive(Default)]
pub struct CountingResources {
    pub releases: AtomicUsize,
}

impl LocalResources for CountingResources {
    fn release(&self) -> pkgmux::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything the UI thread saw.
#[derive(Default)]
pub struct UiLog {
    pub activities: Vec<LocalActivity>,
    pub notifications: Vec<Notification>,
    pub prompts: Vec<Prompt>,
    pub please_wait: Vec<bool>,
    pub managed: Vec<(bool, LocalActivity)>,
    pub repositories_updated: Vec<(i32, String)>,
    pub aborts: Vec<AppRef>,
    pub processed: Vec<AppRef>,
    pub terminal: Vec<String>,
}

/// UI thread stand-in answering prompts from a script.
pub struct UiDriver {
    answers: Arc<Mutex<VecDeque<Answer>>>,
    held: Arc<Mutex<Vec<Responder>>>,
    hold_prompts: Arc<AtomicBool>,
    log: Arc<Mutex<UiLog>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl UiDriver {
    fn start(ui_loop: ui::UiLoop) -> Self {
        let answers: Arc<Mutex<VecDeque<Answer>>> = Arc::default();
        let held: Arc<Mutex<Vec<Responder>>> = Arc::default();
        let hold_prompts = Arc::new(AtomicBool::new(false));
        let log: Arc<Mutex<UiLog>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let answers = Arc::clone(&answers);
            let held = Arc::clone(&held);
            let hold_prompts = Arc::clone(&hold_prompts);
            let log = Arc::clone(&log);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("test-ui".into())
                .spawn(move || {
                    ui_loop.run_until(
                        |event| handle(event, &answers, &held, &hold_prompts, &log),
                        || stop.load(Ordering::SeqCst),
                    )
                })
                .unwrap()
        };

        Self {
            answers,
            held,
            hold_prompts,
            log,
            stop,
            thread: Some(thread),
        }
    }

    /// Queue the answer for the next prompt; prompts without one are dismissed.
    pub fn answer(&self, answer: Answer) {
        self.answers.lock().push_back(answer);
    }

    /// Keep prompts open instead of answering them.
    pub fn hold_prompts(&self, hold: bool) {
        self.hold_prompts.store(hold, Ordering::SeqCst);
    }

    pub fn held_prompts(&self) -> usize {
        self.held.lock().len()
    }

    pub fn log(&self) -> parking_lot::MutexGuard<'_, UiLog> {
        self.log.lock()
    }
}

impl Drop for UiDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.held.lock().clear();
    }
}

fn handle(
    event: UiEvent,
    answers: &Mutex<VecDeque<Answer>>,
    held: &Mutex<Vec<Responder>>,
    hold_prompts: &AtomicBool,
    log: &Mutex<UiLog>,
) {
    let mut log = log.lock();
    match event {
        UiEvent::ActivityChanged(activity) => log.activities.push(activity),
        UiEvent::Notify(notification) => log.notifications.push(notification),
        UiEvent::PleaseWait(show) => log.please_wait.push(show),
        UiEvent::Prompt(request) => {
            log.prompts.push(request.prompt.clone());
            if hold_prompts.load(Ordering::SeqCst) {
                held.lock().push(request.responder);
            } else {
                match answers.lock().pop_front() {
                    Some(answer) => request.responder.resolve(answer),
                    None => request.responder.dismiss(),
                }
            }
        }
        UiEvent::ApplicationsManaged { success, activity } => {
            log.managed.push((success, activity))
        }
        UiEvent::RepositoriesUpdated { result, message } => {
            log.repositories_updated.push((result, message))
        }
        UiEvent::ApplicationAbort { app, .. } => log.aborts.push(app),
        UiEvent::ApplicationProcessed { app, .. } => log.processed.push(app),
        UiEvent::Terminal(text) => log.terminal.push(text),
        _ => {}
    }
}

/// One client process: controller, its UI thread and its collaborators.
pub struct Client {
    pub controller: ServiceController,
    pub ui: UiDriver,
    pub lock: CountingLock,
    pub resources: Arc<CountingResources>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.controller.shutdown();
    }
}

/// Client connected to `daemon`, holding its shared lock from the start.
pub fn client(daemon: &Arc<LoopbackDaemon>, catalog: StaticCatalog) -> Client {
    client_with_licenses(daemon, catalog, LicenseStore::in_memory())
}

pub fn client_with_licenses(
    daemon: &Arc<LoopbackDaemon>,
    catalog: StaticCatalog,
    licenses: LicenseStore,
) -> Client {
    client_with_catalog(daemon, Arc::new(catalog), licenses)
}

pub fn client_with_catalog(
    daemon: &Arc<LoopbackDaemon>,
    catalog: Arc<dyn PackageCatalog>,
    licenses: LicenseStore,
) -> Client {
    let (handle, ui_loop) = ui::channel(256);
    let lock = CountingLock::default();
    let resources = Arc::new(CountingResources::default());

    let controller = ServiceController::builder(daemon.clone(), handle)
        .catalog(catalog)
        .resources(resources.clone())
        .resource_lock(Box::new(lock.clone()), true)
        .licenses(licenses)
        .build()
        .unwrap();

    Client {
        controller,
        ui: UiDriver::start(ui_loop),
        lock,
        resources,
    }
}

pub fn entry(name: &str) -> CatalogEntry {
    CatalogEntry {
        name: name.to_string(),
        ..Default::default()
    }
}

/// Catalog with `foo` (1@main) and `bar` (2@main).
pub fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_entry(AppRef::new(1, "main"), entry("foo"))
        .with_entry(AppRef::new(2, "main"), entry("bar"))
}

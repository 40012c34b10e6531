// src/sync.rs

//! Blocking synchronization primitives used by worker threads
//!
//! - [`Semaphore`]: counting semaphore (checkpoint waits)
//! - [`FireOnceGate`]: binary semaphore initialized to 1 that can only be
//!   consumed without blocking; the first consumer wins
//! - [`Completion`]: one-shot value slot a worker can block on

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Block up to `timeout`; returns whether a permit was taken
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

/// Fire-once gate
///
/// Every completion path calls [`FireOnceGate::try_fire`]; exactly one of
/// them observes `true`, however the calls interleave.
#[derive(Debug, Default)]
pub struct FireOnceGate {
    fired: AtomicBool,
}

impl FireOnceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the gate without blocking
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// One-shot value a worker thread waits for
///
/// Only the first `complete()` is kept, even after the value was taken.
#[derive(Debug)]
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    completed: bool,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                completed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store the value and wake the waiter. Later calls are ignored.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.completed {
            return false;
        }
        slot.completed = true;
        slot.value = Some(value);
        self.ready.notify_all();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.slot.lock().completed
    }

    /// Block until a value is stored and take it
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Block up to `timeout` for the value
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.value.take();
            }
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

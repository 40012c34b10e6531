// src/barrier.rs

//! Activity barrier
//!
//! A writer-preference read/write gate. The writer side brackets the span
//! of one local activity, from a successful `busy()` until its remote
//! completion has been observed; at most one span is open at a time.
//!
//! The reader side is taken by daemon-triggered tasks that must not run
//! inside an open span, such as re-acquiring the shared resource hold after
//! the daemon finished an activity. Waiting writers block new readers, so a
//! flow that is about to open a span is never starved by them.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct BarrierState {
    /// A span is open
    writer: bool,
    /// Writers blocked in `writer_acquire`
    writers_waiting: usize,
    /// Active readers
    readers: usize,
}

/// Writer-preference gate serializing local activity spans
#[derive(Debug, Default)]
pub struct ActivityBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

impl ActivityBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span, blocking until no other span or reader is active
    pub fn writer_acquire(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.changed.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        debug!("activity barrier: writer acquired");
    }

    /// Close the span opened by `writer_acquire`
    pub fn writer_release(&self) {
        let mut state = self.state.lock();
        if !state.writer {
            debug!("activity barrier: writer_release without a writer");
            return;
        }
        state.writer = false;
        debug!("activity barrier: writer released");
        self.changed.notify_all();
    }

    /// Enter the read side, waiting out any open or pending span
    pub fn reader_acquire(&self) {
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.changed.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn reader_release(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.changed.notify_all();
        }
    }

    /// RAII read side
    pub fn read(&self) -> ReadGuard<'_> {
        self.reader_acquire();
        ReadGuard { barrier: self }
    }

    /// Whether a span is currently open
    pub fn is_held(&self) -> bool {
        self.state.lock().writer
    }
}

/// Releases the read side on drop
pub struct ReadGuard<'a> {
    barrier: &'a ActivityBarrier,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.barrier.reader_release();
    }
}

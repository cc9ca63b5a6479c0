//! Pausing, single-stepping and stopping the emulation loop from other
//! threads.
//!
//! The loop only looks at the `RunControl` at instruction boundaries. While
//! paused it blocks on a condition variable until it is resumed, stepped or
//! stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    /// Instructions left to run before pausing again.
    steps: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RunControl {
    state: Mutex<ControlState>,
    wakeup: Condvar,
    stop: AtomicBool,
    /// Set while paused or stepping, so the running loop can skip the lock.
    attention: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<ControlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pauses the loop at the next instruction boundary.
    pub fn request_pause(&self) {
        let mut state = self.lock();
        state.paused = true;
        state.steps = None;
        self.attention.store(true, Ordering::Release);
        debug!("pause requested");
    }

    /// Lets a paused loop continue freely.
    pub fn resume(&self) {
        let mut state = self.lock();
        state.paused = false;
        state.steps = None;
        self.attention.store(false, Ordering::Release);
        self.wakeup.notify_all();
    }

    /// Lets a paused loop run `count` more instructions, then pause again.
    pub fn step(&self, count: u64) {
        let mut state = self.lock();
        if count == 0 {
            state.paused = true;
            state.steps = None;
        } else {
            state.paused = false;
            state.steps = Some(count);
        }
        self.attention.store(true, Ordering::Release);
        self.wakeup.notify_all();
    }

    /// Ends the run at the next instruction boundary, even if paused.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        // Take the lock so a loop about to wait cannot miss the wakeup.
        let _state = self.lock();
        self.wakeup.notify_all();
        debug!("stop requested");
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.attention.load(Ordering::Acquire) && self.lock().paused
    }

    /// Blocks while paused.
    ///
    /// Returns `false` if the loop should stop instead of executing the next
    /// instruction.
    pub fn wait_if_paused(&self) -> bool {
        if !self.attention.load(Ordering::Acquire) {
            return !self.stop_requested();
        }

        let mut state = self.lock();
        while state.paused && !self.stop_requested() {
            state = self.wakeup.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        !self.stop_requested()
    }

    /// Counts down a pending `step` request. Called after each instruction.
    pub fn instruction_retired(&self) {
        if !self.attention.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.lock();
        if let Some(left) = state.steps {
            if left <= 1 {
                state.steps = None;
                state.paused = true;
            } else {
                state.steps = Some(left - 1);
            }
        }
    }
}

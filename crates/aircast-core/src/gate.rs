// crates/aircast-core/src/gate.rs
//
// Pause gate for the adaptive encoder wrappers. Readers observe the flag
// before blocking on their output queue; resuming replaces the notification
// channel so a waiter parked on the previous cycle cannot miss the wake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::cancel::CancelToken;

/// Read-mostly pause flag plus a one-shot resume notification.
///
/// `pause()` raises the flag. `resume()` lowers it and wakes every waiter by
/// dropping the cycle's sender, then installs a fresh channel for the next
/// pause cycle. Both transitions are idempotent.
pub struct PauseGate {
    paused: AtomicBool,
    resume: Mutex<(Sender<()>, Receiver<()>)>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume: Mutex::new(bounded(1)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let mut cycle = self.resume.lock();
        if self.paused.swap(false, Ordering::SeqCst) {
            // Dropping the old sender disconnects every cloned receiver.
            *cycle = bounded(1);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block the caller while the gate is paused.
    ///
    /// Returns `false` if `cancel` fired while waiting. The flag is
    /// re-checked after every wake so a pause that raced the wait is not
    /// missed.
    pub fn wait_while_paused(&self, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            let waiter = {
                let cycle = self.resume.lock();
                // Re-check under the lock: resume() may have swapped the
                // channel between the flag load and the clone.
                if !self.is_paused() {
                    return true;
                }
                cycle.1.clone()
            };
            match waiter.recv_timeout(Duration::from_millis(100)) {
                // Disconnected means the cycle ended: resume happened.
                Err(RecvTimeoutError::Disconnected) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) => continue,
            }
        }
    }
}

//! Monotonic timeline fences for cross-queue synchronization
//!
//! A timeline is a counting event: the render stream signals increasing
//! values and other threads wait on them. The commit thread's wait must be
//! interruptible so shutdown never deadlocks on a fence that will not
//! arrive once the owning stream is being torn down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Token observed by blocking waits so shutdown can interrupt them.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the token; all waits observing it return promptly.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Monotonic counting fence on a GPU stream.
pub trait Timeline: Send + Sync {
    /// Signal the timeline up to `value` (monotonic; lower values are ignored).
    fn signal(&self, value: u64);

    /// Highest value observed as completed.
    fn completed(&self) -> u64;

    /// Block until `value` completes. Returns false if cancelled first.
    fn wait(&self, value: u64, cancel: &CancelToken) -> bool;

    /// Block until `value` completes, ignoring cancellation.
    fn synchronize(&self, value: u64);
}

/// Host-side timeline backed by a mutex and condvar.
///
/// Stands in for a GPU timeline semaphore in tests and headless runs.
pub struct HostTimeline {
    value: Mutex<u64>,
    cv: Condvar,
}

impl HostTimeline {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
            cv: Condvar::new(),
        }
    }
}

impl Default for HostTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline for HostTimeline {
    fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
            self.cv.notify_all();
        }
    }

    fn completed(&self) -> u64 {
        *self.value.lock()
    }

    fn wait(&self, value: u64, cancel: &CancelToken) -> bool {
        let mut current = self.value.lock();
        loop {
            if *current >= value {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            // Bounded wait so cancellation is observed without a dedicated wakeup
            self.cv.wait_for(&mut current, Duration::from_millis(5));
        }
    }

    fn synchronize(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.cv.wait(&mut current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_and_completed() {
        let timeline = HostTimeline::new();
        assert_eq!(timeline.completed(), 0);

        timeline.signal(3);
        assert_eq!(timeline.completed(), 3);

        // Lower signals never regress the counter
        timeline.signal(1);
        assert_eq!(timeline.completed(), 3);
    }

    #[test]
    fn test_wait_returns_when_signalled() {
        let timeline = Arc::new(HostTimeline::new());
        let cancel = CancelToken::new();

        let t = {
            let timeline = timeline.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                timeline.signal(5);
            })
        };

        assert!(timeline.wait(5, &cancel));
        t.join().unwrap();
    }

    #[test]
    fn test_wait_cancelled() {
        let timeline = HostTimeline::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        // Value 1 is never signalled; cancellation must unblock the wait
        assert!(!timeline.wait(1, &cancel));
    }

    #[test]
    fn test_wait_already_completed() {
        let timeline = HostTimeline::new();
        timeline.signal(10);

        let cancel = CancelToken::new();
        cancel.cancel();
        // Completed values win even against a cancelled token
        assert!(timeline.wait(10, &cancel));
    }
}

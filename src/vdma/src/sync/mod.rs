//! Blocking primitives for the completion path
//!
//! The short-hold locks around channel bookkeeping are `spin` mutexes;
//! anything that sleeps goes through the types here.

use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard};

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    // a panicking waker cannot corrupt a counter or a flag
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait queue for threads sleeping until a condition becomes true
pub struct WaitQueue {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Sleeps until `cond` holds or `timeout` elapses; returns `cond()`
    ///
    /// `cond` is evaluated with the queue lock held, and wakers take the
    /// same lock, so a wakeup between the check and the sleep is not lost.
    pub fn wait_until<F>(&self, timeout: Duration, cond: F) -> bool
    where
        F: Fn() -> bool,
    {
        let guard = relock(self.seq.lock());
        let (_guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| !cond())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cond()
    }

    /// Wakes every sleeper so it re-checks its condition
    pub fn wake_all(&self) {
        let mut seq = relock(self.seq.lock());
        *seq = seq.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Number of wake-ups issued so far
    pub fn wakeups(&self) -> u64 {
        *relock(self.seq.lock())
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Auto-reset event: `signal` sets it, a successful wait consumes it
pub struct Event {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut set = relock(self.set.lock());
        *set = true;
        self.cv.notify_all();
    }

    /// Waits for the event; returns whether it was signalled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = relock(self.set.lock());
        let (mut set, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let was_set = *set;
        *set = false;
        was_set
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

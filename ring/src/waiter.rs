// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Sleep/wake coordination for queue halves.

use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A condition variable with a waiter count in front of it.
///
/// [`kick`] is designed for hot paths: it is a single atomic load when
/// nobody is parked, and only takes the lock and issues the broadcast when
/// the counter says someone might be sleeping.
///
/// The counter is maintained with `SeqCst` operations and [`kick`] starts
/// with a `SeqCst` fence so that either the kicker observes the waiter's
/// registration, or the waiter's predicate observes whatever state change
/// preceded the kick.
///
/// [`kick`]: Waiter::kick
pub struct Waiter {
    waiting: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub const fn new() -> Self {
        Self {
            waiting: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Park the calling thread until `ready` returns true.
    ///
    /// `ready` is evaluated with the internal lock held, so a [`kick`]
    /// cannot slip between the predicate check and the actual wait.
    ///
    /// [`kick`]: Waiter::kick
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock();
        while !ready() {
            self.cond.wait(&mut guard);
        }
        drop(guard);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Park the calling thread until `ready` returns true or `timeout`
    /// elapses.  Returns the final value of the predicate.
    pub fn wait_timeout(&self, mut ready: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock();
        let mut satisfied = ready();
        while !satisfied {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                satisfied = ready();
                break;
            }
            satisfied = ready();
        }
        drop(guard);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        satisfied
    }

    /// Wake every parked thread, if any.
    ///
    /// Costs one atomic load when the waiter count is zero.
    pub fn kick(&self) {
        fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::Relaxed) != 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn kick_wakes_parked_thread() {
        let waiter = Arc::new(Waiter::new());
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let waiter = Arc::clone(&waiter);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                waiter.wait_until(|| flag.load(Ordering::SeqCst));
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        waiter.kick();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_predicate() {
        let waiter = Waiter::new();
        assert!(!waiter.wait_timeout(|| false, Duration::from_millis(10)));
        assert!(waiter.wait_timeout(|| true, Duration::from_millis(10)));
    }
}

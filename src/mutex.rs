//! Gateway entry lock
//!
//! A single-holder try-lock guarding the monitor's mutable state against
//! re-entrant gateway calls. The monitor has no scheduler to yield to, so
//! blocking is never an option: a caller that loses the race reports the
//! failure to Non-Secure instead of spinning.

use core::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion without blocking.
pub struct Mutex {
    locked: AtomicBool,
}

impl Mutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Mutex {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock once, returning a guard on success.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(LockGuard { mutex: self })
        }
    }
}

/// Holds the lock; releases it on drop, on every exit path.
///
/// The guard returned by [`Mutex::try_lock`] is the only way to hold the
/// lock.
pub struct LockGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Spin lock with adaptive backoff: pause → yield → sleep.
// `SpinMutex<T>` wraps the raw lock with a guard for the engine's
// short-critical-section side queues.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff ladder.
///
/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A simple spin lock with adaptive backoff.
///
/// Uses an `AtomicU32` exchanged to 1 on lock, stored to 0 on unlock,
/// with adaptive yield between retries.
pub struct SpinLock {
    lc: AtomicU32,
}

impl SpinLock {
    /// Create a new unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            lc: AtomicU32::new(0),
        }
    }

    /// Acquire the lock (spinning with adaptive backoff).
    pub fn lock(&self) {
        let mut k = 0u32;
        while self.lc.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.lc.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: SpinLock is designed for concurrent access.
unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A value guarded by a [`SpinLock`], released through an RAII guard.
///
/// Intended for queues whose critical sections are a handful of pointer
/// moves; anything that can block must use a real mutex instead.
pub struct SpinMutex<T> {
    lock: SpinLock,
    value: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock and return a guard dereferencing to the value.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { owner: self }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

pub struct SpinMutexGuard<'a, T> {
    owner: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.unlock();
    }
}

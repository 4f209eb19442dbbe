// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-progress gate: at most one thread runs the plugin's blocking
// progress call per context; others wait out the remaining timeout.
//
// The gate is a single 32-bit atomic. The low 31 bits count threads
// currently inside Progress; bit 31 is held by the thread actively
// running the plugin call. The condvar hands the lock bit to a waiter on
// exit. The gate shares neither mutex nor condvar with the trigger loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::error::{NaError, NaResult};

const LOCK: u32 = 1 << 31;

pub(crate) struct ProgressGate {
    word: AtomicU32,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ProgressGate {
    pub fn new() -> ProgressGate {
        ProgressGate {
            word: AtomicU32::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Enter the gate, acquiring the lock bit. Fails with `Timeout` once
    /// `deadline` passes without the bit becoming free.
    pub fn enter(&self, deadline: Instant) -> NaResult<()> {
        self.word.fetch_add(1, Ordering::AcqRel);
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & LOCK == 0 {
                if self
                    .word
                    .compare_exchange_weak(cur, cur | LOCK, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                self.word.fetch_sub(1, Ordering::AcqRel);
                return Err(NaError::Timeout);
            }
            let remaining = deadline - now;
            let guard = self.mutex.lock().unwrap();
            // Holder may have exited between the load and the lock.
            if self.word.load(Ordering::Acquire) & LOCK == 0 {
                continue;
            }
            let _ = self.cond.wait_timeout(guard, remaining).unwrap();
        }
    }

    /// Leave the gate: one CAS drops the count and clears the lock bit.
    /// If other threads remain inside Progress, hand one of them the bit.
    pub fn exit(&self) {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            debug_assert!(cur & LOCK != 0);
            debug_assert!(cur & !LOCK > 0);
            let next = (cur - 1) ^ LOCK;
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next & !LOCK > 0 {
                        let _guard = self.mutex.lock().unwrap();
                        self.cond.notify_one();
                    }
                    return;
                }
                Err(now) => cur = now,
            }
        }
    }

    /// Number of threads currently inside Progress (tests only).
    #[cfg(test)]
    pub fn in_progress(&self) -> u32 {
        self.word.load(Ordering::Acquire) & !LOCK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_thread_enter_exit() {
        let gate = ProgressGate::new();
        gate.enter(Instant::now() + Duration::from_millis(10)).unwrap();
        assert_eq!(gate.in_progress(), 1);
        gate.exit();
        assert_eq!(gate.in_progress(), 0);
    }

    #[test]
    fn contended_timeout() {
        let gate = Arc::new(ProgressGate::new());
        gate.enter(Instant::now() + Duration::from_millis(10)).unwrap();

        let g = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            g.enter(Instant::now() + Duration::from_millis(50))
        });
        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(NaError::Timeout)));
        gate.exit();
        assert_eq!(gate.in_progress(), 0);
    }

    #[test]
    fn mutual_exclusion_with_handoff() {
        let gate = Arc::new(ProgressGate::new());
        let inside = Arc::new(Counter::new(0));
        let max_seen = Arc::new(Counter::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        gate.enter(Instant::now() + Duration::from_secs(5)).unwrap();
                        let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        gate.exit();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(gate.in_progress(), 0);
    }
}

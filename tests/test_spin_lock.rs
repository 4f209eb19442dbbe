// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SpinLock and SpinMutex behavior under contention.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libnal::{SpinLock, SpinMutex};

#[test]
fn basic_lock_unlock() {
    let lock = SpinLock::new();
    lock.lock();
    lock.unlock();
}

#[test]
fn multiple_cycles() {
    let lock = SpinLock::new();
    for _ in 0..100 {
        lock.lock();
        lock.unlock();
    }
}

#[test]
fn critical_section() {
    let lock = Arc::new(SpinLock::new());
    let counter = Arc::new(AtomicI32::new(0));
    let iterations = 1000;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..iterations {
                    lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                    lock.unlock();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), iterations * 2);
}

#[test]
fn mutual_exclusion() {
    let lock = Arc::new(SpinLock::new());
    let t1_in_cs = Arc::new(AtomicBool::new(false));
    let t2_in_cs = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));

    let make_task = |my_flag: Arc<AtomicBool>,
                     other_flag: Arc<AtomicBool>,
                     viol: Arc<AtomicBool>,
                     lk: Arc<SpinLock>| {
        thread::spawn(move || {
            for _ in 0..100 {
                lk.lock();
                my_flag.store(true, Ordering::SeqCst);
                if other_flag.load(Ordering::SeqCst) {
                    viol.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(10));
                my_flag.store(false, Ordering::SeqCst);
                lk.unlock();
                thread::yield_now();
            }
        })
    };

    let t1 = make_task(
        Arc::clone(&t1_in_cs),
        Arc::clone(&t2_in_cs),
        Arc::clone(&violation),
        Arc::clone(&lock),
    );
    let t2 = make_task(
        Arc::clone(&t2_in_cs),
        Arc::clone(&t1_in_cs),
        Arc::clone(&violation),
        Arc::clone(&lock),
    );

    t1.join().unwrap();
    t2.join().unwrap();

    assert!(!violation.load(Ordering::SeqCst));
}

#[test]
fn spin_mutex_guards_value() {
    let m = Arc::new(SpinMutex::new(Vec::<u32>::new()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for i in 0..250u32 {
                    m.lock().push(t * 1000 + i);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let guard = m.lock();
    assert_eq!(guard.len(), 1000);
}

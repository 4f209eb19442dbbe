// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Poll-set dispatch: registered callbacks run on readiness, report
// progress, and can be removed.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libnal::{NaResult, Notifier, PollEvent, PollSet};

struct CountingHandler {
    notifier: Arc<Notifier>,
    hits: AtomicUsize,
}

impl PollEvent for CountingHandler {
    fn on_ready(&self, error: bool) -> NaResult<bool> {
        assert!(!error);
        let signaled = self.notifier.get()?;
        if signaled {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(signaled)
    }
}

fn notifier(tag: &str) -> Arc<Notifier> {
    let dir = std::env::temp_dir();
    let name = format!("nal-pollset-{}-{}", std::process::id(), tag);
    Arc::new(Notifier::new(&dir, &name).unwrap())
}

#[test]
fn wait_times_out_when_idle() {
    let poll = PollSet::new().unwrap();
    assert!(!poll.wait(0).unwrap());
    assert!(!poll.wait(20).unwrap());
}

#[test]
fn ready_fd_dispatches_callback() {
    let poll = PollSet::new().unwrap();
    let n = notifier("dispatch");
    let handler = Arc::new(CountingHandler {
        notifier: Arc::clone(&n),
        hits: AtomicUsize::new(0),
    });
    poll.add(n.as_raw_fd(), Arc::clone(&handler) as Arc<dyn PollEvent>)
        .unwrap();

    assert!(!poll.wait(0).unwrap());
    n.set().unwrap();
    assert!(poll.wait(1000).unwrap());
    assert_eq!(handler.hits.load(Ordering::SeqCst), 1);

    // Edge cleared: nothing further.
    assert!(!poll.wait(0).unwrap());
}

#[test]
fn one_signal_wakes_one_wait() {
    let poll = PollSet::new().unwrap();
    let n = notifier("single");
    let handler = Arc::new(CountingHandler {
        notifier: Arc::clone(&n),
        hits: AtomicUsize::new(0),
    });
    poll.add(n.as_raw_fd(), Arc::clone(&handler) as Arc<dyn PollEvent>)
        .unwrap();

    for _ in 0..3 {
        n.set().unwrap();
    }
    assert!(poll.wait(1000).unwrap());
    assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    assert!(!poll.wait(0).unwrap());
}

#[test]
fn removed_fd_no_longer_dispatches() {
    let poll = PollSet::new().unwrap();
    let n = notifier("removed");
    let handler = Arc::new(CountingHandler {
        notifier: Arc::clone(&n),
        hits: AtomicUsize::new(0),
    });
    poll.add(n.as_raw_fd(), Arc::clone(&handler) as Arc<dyn PollEvent>)
        .unwrap();
    poll.remove(n.as_raw_fd()).unwrap();

    n.set().unwrap();
    assert!(!poll.wait(20).unwrap());
    assert_eq!(handler.hits.load(Ordering::SeqCst), 0);

    // Removing twice is harmless.
    poll.remove(n.as_raw_fd()).unwrap();
}

#[test]
fn duplicate_registration_rejected() {
    let poll = PollSet::new().unwrap();
    let n = notifier("dup");
    let handler = Arc::new(CountingHandler {
        notifier: Arc::clone(&n),
        hits: AtomicUsize::new(0),
    });
    poll.add(n.as_raw_fd(), Arc::clone(&handler) as Arc<dyn PollEvent>)
        .unwrap();
    assert!(poll
        .add(n.as_raw_fd(), Arc::clone(&handler) as Arc<dyn PollEvent>)
        .is_err());
}

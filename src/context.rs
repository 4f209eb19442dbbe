// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Completion domain of a class.
//
// A context owns a bounded lock-free fast queue of completion records and
// an unbounded overflow FIFO guarded by a mutex and condvar. Engines call
// completion_add; any number of threads drain with trigger. Records are
// consumed exactly once: the user callback runs first, then the plugin
// release callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::bounded_queue::BoundedQueue;
use crate::error::{NaError, NaResult};
use crate::plugin::Addr;
use crate::progress::ProgressGate;

/// Depth of the fast completion path.
const FAST_DEPTH: usize = 1024;

/// User-visible completion callback. Invoked exactly once per accepted
/// operation, from whichever thread runs `trigger`. Must not block.
pub type Callback = Box<dyn FnOnce(&CallbackInfo, &NaResult<()>) + Send>;

/// Kind-specific completion payload.
pub enum CallbackInfo {
    /// Address lookup. `addr` is absent when the lookup was canceled.
    Lookup { addr: Option<Addr> },
    SendUnexpected,
    /// Received a message nobody pre-posted for. `source` holds one
    /// reference the consumer must eventually free.
    RecvUnexpected {
        source: Option<Addr>,
        tag: u32,
        data: Vec<u8>,
    },
    SendExpected,
    RecvExpected { data: Vec<u8> },
    Put,
    Get,
}

impl std::fmt::Debug for CallbackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackInfo::Lookup { addr } => f
                .debug_struct("Lookup")
                .field("addr", &addr.is_some())
                .finish(),
            CallbackInfo::SendUnexpected => f.write_str("SendUnexpected"),
            CallbackInfo::RecvUnexpected { tag, data, .. } => f
                .debug_struct("RecvUnexpected")
                .field("tag", tag)
                .field("len", &data.len())
                .finish(),
            CallbackInfo::SendExpected => f.write_str("SendExpected"),
            CallbackInfo::RecvExpected { data } => f
                .debug_struct("RecvExpected")
                .field("len", &data.len())
                .finish(),
            CallbackInfo::Put => f.write_str("Put"),
            CallbackInfo::Get => f.write_str("Get"),
        }
    }
}

/// One completion record, produced by a plugin engine and consumed
/// exactly once by the trigger loop.
pub struct Completion {
    pub result: NaResult<()>,
    pub info: CallbackInfo,
    pub(crate) callback: Option<Callback>,
    pub(crate) release: Option<Box<dyn FnOnce() + Send>>,
}

/// A completion domain. One class may own many contexts.
pub struct Context {
    fast: BoundedQueue<Completion>,
    overflow: Mutex<VecDeque<Box<Completion>>>,
    overflow_count: AtomicUsize,
    trigger_waiting: AtomicU32,
    cond: Condvar,
    pub(crate) gate: ProgressGate,
}

impl Context {
    pub(crate) fn new() -> Arc<Context> {
        Arc::new(Context {
            fast: BoundedQueue::new(FAST_DEPTH),
            overflow: Mutex::new(VecDeque::new()),
            overflow_count: AtomicUsize::new(0),
            trigger_waiting: AtomicU32::new(0),
            cond: Condvar::new(),
            gate: ProgressGate::new(),
        })
    }

    /// Publish a completion record: fast path first, overflow when full,
    /// then wake a waiting trigger if there is one.
    pub(crate) fn completion_add(&self, record: Box<Completion>) {
        if let Err(record) = self.fast.push(record) {
            let mut overflow = self.overflow.lock().unwrap();
            overflow.push_back(record);
            self.overflow_count.fetch_add(1, Ordering::SeqCst);
        }
        if self.trigger_waiting.load(Ordering::SeqCst) > 0 {
            let _guard = self.overflow.lock().unwrap();
            self.cond.notify_one();
        }
    }

    fn take_one(&self) -> Option<Box<Completion>> {
        if let Some(c) = self.fast.pop() {
            return Some(c);
        }
        if self.overflow_count.load(Ordering::SeqCst) > 0 {
            let mut overflow = self.overflow.lock().unwrap();
            if let Some(c) = overflow.pop_front() {
                self.overflow_count.fetch_sub(1, Ordering::SeqCst);
                return Some(c);
            }
        }
        None
    }

    /// Drain up to `max_count` completions, waiting up to `timeout_ms`
    /// (0 = poll once) for the first one. Returns the number dispatched;
    /// `Timeout` if the deadline passed with none.
    pub fn trigger(&self, timeout_ms: u32, max_count: usize) -> NaResult<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut count = 0usize;

        while count < max_count {
            let record = match self.take_one() {
                Some(r) => r,
                None => {
                    if count > 0 {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(NaError::Timeout);
                    }
                    let guard = self.overflow.lock().unwrap();
                    self.trigger_waiting.fetch_add(1, Ordering::SeqCst);
                    // Re-check after raising the waiter flag: a concurrent
                    // completion_add may have published before seeing it.
                    if self.fast.is_empty() && self.overflow_count.load(Ordering::SeqCst) == 0 {
                        let _ = self.cond.wait_timeout(guard, deadline - now).unwrap();
                    }
                    self.trigger_waiting.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            };

            let Completion {
                result,
                info,
                callback,
                release,
            } = *record;
            if let Some(cb) = callback {
                cb(&info, &result);
            }
            if let Some(rel) = release {
                rel();
            }
            count += 1;
        }
        Ok(count)
    }

    /// Whether both completion paths are empty. Racy by nature.
    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.overflow_count.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn completion(n: usize, log: &Arc<Mutex<Vec<usize>>>) -> Box<Completion> {
        let log = Arc::clone(log);
        Box::new(Completion {
            result: Ok(()),
            info: CallbackInfo::SendUnexpected,
            callback: Some(Box::new(move |_, _| {
                log.lock().unwrap().push(n);
            })),
            release: None,
        })
    }

    #[test]
    fn trigger_empty_times_out() {
        let ctx = Context::new();
        assert!(matches!(ctx.trigger(10, 8), Err(NaError::Timeout)));
    }

    #[test]
    fn trigger_respects_max_count() {
        let ctx = Context::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            ctx.completion_add(completion(i, &log));
        }
        assert_eq!(ctx.trigger(0, 4).unwrap(), 4);
        assert_eq!(ctx.trigger(0, 100).unwrap(), 6);
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(ctx.is_empty());
    }

    #[test]
    fn overflow_keeps_every_completion() {
        // Push well past the fast-path depth; nothing may be lost and
        // each of the two paths must drain FIFO.
        let ctx = Context::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let total = 3000usize;
        for i in 0..total {
            ctx.completion_add(completion(i, &log));
        }
        let mut got = 0;
        while got < total {
            got += ctx.trigger(100, 256).unwrap();
        }
        assert_eq!(got, total);
        assert!(ctx.is_empty());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), total);
        // Fast-path entries (0..1024) stay in order, as do overflow
        // entries (1024..), though the merge order is unspecified.
        let mut last_fast = None;
        let mut last_over = None;
        for &n in log.iter() {
            if n < 1024 {
                assert!(last_fast.map_or(true, |p| p < n));
                last_fast = Some(n);
            } else {
                assert!(last_over.map_or(true, |p| p < n));
                last_over = Some(n);
            }
        }
    }

    #[test]
    fn waiting_trigger_wakes_on_add() {
        let ctx = Context::new();
        let ctx2 = Arc::clone(&ctx);
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = Arc::clone(&delivered);

        let waiter = thread::spawn(move || {
            let n = ctx2.trigger(5_000, 1).unwrap();
            delivered2.fetch_add(n, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        let log = Arc::new(Mutex::new(Vec::new()));
        ctx.completion_add(completion(7, &log));
        waiter.join().unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }
}

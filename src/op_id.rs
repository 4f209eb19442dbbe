// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Recyclable operation handles.
//
// An op id is bound at post time to a context, an operation kind, the
// user callback, and the message parameters. Status bits: COMPLETED,
// CANCELED, QUEUED. An op starts completed; it may only be (re)posted
// while COMPLETED is set and the protocol refcount is 1, and the refcount
// moves 1→2 through a CAS spin so a re-post waits for the previous
// trigger's release to retire the handle.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::context::{Callback, Context};
use crate::error::{NaError, NaResult};
use crate::plugin::Addr;
use crate::spin_lock::{adaptive_yield, SpinMutex};

pub(crate) const STATUS_COMPLETED: u8 = 1 << 0;
pub(crate) const STATUS_CANCELED: u8 = 1 << 1;
pub(crate) const STATUS_QUEUED: u8 = 1 << 2;

/// Operation kinds carried by an op id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    None,
    Lookup,
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Mutable per-post state, rebound on every post.
pub(crate) struct OpState {
    pub kind: OpKind,
    pub context: Option<Arc<Context>>,
    pub callback: Option<Callback>,
    /// Bound peer address; holds one protocol reference while bound.
    pub addr: Option<Addr>,
    pub tag: u32,
    /// Send payload, staged until a copy slot is available.
    pub payload: Vec<u8>,
    /// Receive capacity the caller is prepared to accept.
    pub max_len: usize,
}

impl OpState {
    fn idle() -> OpState {
        OpState {
            kind: OpKind::None,
            context: None,
            callback: None,
            addr: None,
            tag: 0,
            payload: Vec::new(),
            max_len: 0,
        }
    }
}

pub(crate) struct OpInner {
    key: usize,
    pub(crate) status: AtomicU8,
    pub(crate) refs: AtomicU32,
    pub(crate) state: SpinMutex<OpState>,
}

/// A reusable operation handle.
#[derive(Clone)]
pub struct OpId {
    pub(crate) inner: Arc<OpInner>,
}

impl OpId {
    pub fn is_completed(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) & STATUS_COMPLETED != 0
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) & STATUS_CANCELED != 0
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) & STATUS_QUEUED != 0
    }

    /// Reuse check: the op must be COMPLETED, and the refcount must move
    /// 1→2. A pending release (refcount still 2) is waited out; anything
    /// else is a concurrent post and fails with `Busy`.
    pub(crate) fn acquire_for_post(&self) -> NaResult<()> {
        if !self.is_completed() {
            return Err(NaError::Busy);
        }
        let mut k = 0u32;
        loop {
            match self
                .inner
                .refs
                .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(2) => adaptive_yield(&mut k),
                Err(_) => return Err(NaError::Busy),
            }
        }
        self.inner.status.store(0, Ordering::Release);
        Ok(())
    }

    /// Undo a failed post: restore the idle state and the refcount.
    pub(crate) fn abort_post(&self) {
        let addr = {
            let mut st = self.inner.state.lock();
            let addr = st.addr.take();
            *st = OpState::idle();
            addr
        };
        if let Some(a) = addr {
            a.release();
        }
        self.inner.status.store(STATUS_COMPLETED, Ordering::Release);
        self.inner.refs.store(1, Ordering::Release);
    }

    pub(crate) fn mark_queued(&self) {
        self.inner.status.fetch_or(STATUS_QUEUED, Ordering::AcqRel);
    }

    pub(crate) fn clear_queued(&self) {
        self.inner
            .status
            .fetch_and(!STATUS_QUEUED, Ordering::AcqRel);
    }

    /// Set CANCELED unless the op already completed. Returns whether the
    /// bit was set (cancel wins) or not (completion won).
    pub(crate) fn set_canceled(&self) -> bool {
        self.inner
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s & STATUS_COMPLETED != 0 {
                    None
                } else {
                    Some(s | STATUS_CANCELED)
                }
            })
            .is_ok()
    }

    /// Mark completion. QUEUED is cleared; CANCELED is preserved.
    pub(crate) fn mark_completed(&self) {
        self.inner
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some((s & !STATUS_QUEUED) | STATUS_COMPLETED)
            })
            .ok();
    }

    /// Release-callback side: drop the post reference taken by
    /// `acquire_for_post`, making the op reusable.
    pub(crate) fn retire(&self) {
        self.inner.refs.store(1, Ordering::Release);
    }

    /// Whether two handles refer to the same op.
    pub(crate) fn same_op(&self, other: &OpId) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpId")
            .field("key", &self.inner.key)
            .field("status", &self.inner.status.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pool of op ids with stable keys; part of a class.
pub(crate) struct OpPool {
    slab: Mutex<Slab<Arc<OpInner>>>,
}

impl OpPool {
    pub fn new() -> OpPool {
        OpPool {
            slab: Mutex::new(Slab::new()),
        }
    }

    /// Allocate a fresh op id: COMPLETED, refcount 1.
    pub fn create(&self) -> OpId {
        let mut slab = self.slab.lock().unwrap();
        let entry = slab.vacant_entry();
        let inner = Arc::new(OpInner {
            key: entry.key(),
            status: AtomicU8::new(STATUS_COMPLETED),
            refs: AtomicU32::new(1),
            state: SpinMutex::new(OpState::idle()),
        });
        entry.insert(Arc::clone(&inner));
        OpId { inner }
    }

    /// Destroy an op id. The op must be idle (COMPLETED, refcount 1).
    pub fn destroy(&self, op: OpId) -> NaResult<()> {
        if !op.is_completed() {
            return Err(NaError::Busy);
        }
        if op
            .inner
            .refs
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NaError::Busy);
        }
        self.slab.lock().unwrap().remove(op.inner.key);
        Ok(())
    }
}

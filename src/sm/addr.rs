// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-peer address records.
//
// One SmAddr per peer endpoint, created by lookup, by accept, or for the
// local endpoint itself. The protocol refcount drives resource teardown:
// poll-set registrations, notifier fds, the mapped ring pair. The state
// machine fields filled during connection establishment are write-once.

use std::any::Any;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::notifier::Notifier;
use crate::plugin::NetAddr;
use crate::sm::copy_buf::CopyBuf;
use crate::sm::ring::SmRing;
use crate::sm::SmEngine;

/// Socket-side establishment phase.
pub(crate) const SOCK_ADDR_INFO: u8 = 0;
pub(crate) const SOCK_CONN_ID: u8 = 1;
pub(crate) const SOCK_DONE: u8 = 2;

pub(crate) struct SmAddr {
    pub engine: Weak<SmEngine>,
    /// Peer identity. Unknown until ADDR_INFO for accepted peers.
    pub pid: AtomicU32,
    pub id: AtomicU8,
    pub conn_id: AtomicU32,
    refs: AtomicU32,
    pub self_flag: bool,
    pub accepted: bool,
    pub sock_progress: AtomicU8,
    pub sock: Mutex<Option<UnixStream>>,
    /// Notifier this side waits on (registered in the poll set).
    pub local_notify: OnceLock<Notifier>,
    /// Notifier signaled to wake the peer.
    pub remote_notify: OnceLock<Notifier>,
    /// Headers this side publishes for the peer.
    pub tx_ring: OnceLock<SmRing>,
    /// Headers the peer publishes for this side.
    pub rx_ring: OnceLock<SmRing>,
    /// Copy arena of the connection (the listening endpoint's slab).
    pub copy_buf: OnceLock<Arc<CopyBuf>>,
    released: AtomicBool,
}

impl SmAddr {
    pub fn new(engine: Weak<SmEngine>, pid: u32, id: u8, self_flag: bool, accepted: bool) -> SmAddr {
        SmAddr {
            engine,
            pid: AtomicU32::new(pid),
            id: AtomicU8::new(id),
            conn_id: AtomicU32::new(0),
            refs: AtomicU32::new(1),
            self_flag,
            accepted,
            sock_progress: AtomicU8::new(if accepted { SOCK_ADDR_INFO } else { SOCK_DONE }),
            sock: Mutex::new(None),
            local_notify: OnceLock::new(),
            remote_notify: OnceLock::new(),
            tx_ring: OnceLock::new(),
            rx_ring: OnceLock::new(),
            copy_buf: OnceLock::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u8 {
        self.id.load(Ordering::Acquire)
    }

    /// `sm://pid/id` host part.
    pub fn host_string(&self) -> String {
        format!("{}/{}", self.pid(), self.id())
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Force teardown regardless of the refcount (peer disconnect,
    /// finalize). Idempotent.
    pub fn teardown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.addr_teardown(self);
        }
        // Close the establishment socket last; rings and notifiers are
        // dropped with the record.
        *self.sock.lock().unwrap() = None;
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl NetAddr for SmAddr {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_self_addr(&self) -> bool {
        self.self_flag
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last reference: detach from the engine. The caller still holds
        // the Arc during this call, so the record outlives the teardown.
        self.teardown();
    }
}

impl std::fmt::Debug for SmAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmAddr")
            .field("pid", &self.pid())
            .field("id", &self.id())
            .field("conn_id", &self.conn_id.load(Ordering::Relaxed))
            .field("self", &self.self_flag)
            .field("accepted", &self.accepted)
            .field("refs", &self.refcount())
            .finish()
    }
}

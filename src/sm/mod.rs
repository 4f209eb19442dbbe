// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory transport plugin.
//
// Connections are established over a UNIX socket with fd passing; message
// headers travel through lock-free rings in shared memory, payloads
// through the listening endpoint's copy-slot arena, and wakeups through
// notifier fds registered in the engine's poll set. Sends that find the
// arena exhausted queue on the retry list (unless the class runs with
// NO_RETRY) and are replayed on later progress calls.

mod addr;
mod conn;
pub mod copy_buf;
pub mod paths;
pub mod ring;

pub use copy_buf::{COPY_SIZE, NUM_BUFS};
pub use paths::cleanup;
pub use ring::RING_SIZE;

use std::collections::VecDeque;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use crate::context::{CallbackInfo, Completion, Context};
use crate::error::{NaError, NaResult};
use crate::notifier::Notifier;
use crate::op_id::{OpId, OpKind};
use crate::platform::{self, CopyDirection};
use crate::plugin::{Addr, InitOpts, NetAddr, Plugin, ProgressMode, RmaArgs};
use crate::poll_set::{PollEvent, PollSet};
use crate::spin_lock::SpinMutex;

use addr::{SmAddr, SOCK_ADDR_INFO, SOCK_CONN_ID, SOCK_DONE};
use copy_buf::CopyBuf;
use ring::{MsgHeader, MsgKind, SmRing};

/// Instance ids handed out when the info string does not pin one.
static NEXT_AUTO_ID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn check_protocol(protocol: &str) -> bool {
    protocol == "sm"
}

pub(crate) fn new_plugin() -> Box<dyn Plugin> {
    Box::new(SmPlugin { engine: None })
}

/// A message that arrived before anyone posted an unexpected receive.
/// The payload was already copied out so the arena slot is free again.
struct UnexpectedMsg {
    source: Arc<SmAddr>,
    tag: u32,
    data: Vec<u8>,
}

pub(crate) struct SmEngine {
    weak: Weak<SmEngine>,
    pid: u32,
    id: u8,
    no_retry: bool,
    poll: PollSet,
    listener: Mutex<Option<UnixListener>>,
    last_accept: Mutex<Option<Instant>>,
    next_conn_id: AtomicU32,
    /// Own copy arena; present only when listening.
    arena: Option<Arc<CopyBuf>>,
    self_addr: OnceLock<Arc<SmAddr>>,
    /// Server-side records for every accepted connection.
    accepted: SpinMutex<Vec<Arc<SmAddr>>>,
    /// Established peers whose recv ring is scanned by try_wait.
    poll_addrs: SpinMutex<Vec<Arc<SmAddr>>>,
    /// Lookups waiting for the CONN_ID phase.
    lookup_ops: SpinMutex<Vec<(OpId, Arc<SmAddr>)>>,
    unexpected_ops: SpinMutex<VecDeque<OpId>>,
    expected_ops: SpinMutex<VecDeque<OpId>>,
    retry_ops: SpinMutex<VecDeque<OpId>>,
    unexpected_msgs: SpinMutex<VecDeque<UnexpectedMsg>>,
    instance_dir: PathBuf,
    finalized: AtomicBool,
}

// ---------------------------------------------------------------------------
// Poll-set event dispatch
// ---------------------------------------------------------------------------

enum EventKind {
    Accept,
    Sock,
    Notify,
}

struct SmEvent {
    engine: Weak<SmEngine>,
    addr: Option<Arc<SmAddr>>,
    kind: EventKind,
}

impl PollEvent for SmEvent {
    fn on_ready(&self, error: bool) -> NaResult<bool> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(false);
        };
        if let Some(addr) = &self.addr {
            if addr.is_released() {
                return Ok(false);
            }
            if error {
                engine.peer_error(addr);
                return Ok(true);
            }
        } else if error {
            return Ok(false);
        }
        match self.kind {
            EventKind::Accept => engine.on_accept(),
            EventKind::Sock => engine.on_sock(self.addr.as_ref().unwrap()),
            EventKind::Notify => engine.on_notify(self.addr.as_ref().unwrap()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl SmEngine {
    fn new(pid: u32, id: u8, listen: bool, opts: &InitOpts) -> NaResult<Arc<SmEngine>> {
        let instance_dir = paths::instance_dir(pid, id);
        std::fs::create_dir_all(&instance_dir).map_err(NaError::Protocol)?;

        let poll = PollSet::new()?;
        let mut arena = None;
        let mut listener = None;
        if listen {
            arena = Some(Arc::new(CopyBuf::create(&paths::copy_buf_name(pid, id))?));
            let l = UnixListener::bind(paths::sock_path(pid, id)).map_err(NaError::Protocol)?;
            l.set_nonblocking(true).map_err(NaError::Protocol)?;
            listener = Some(l);
        }

        let engine = Arc::new_cyclic(|weak| SmEngine {
            weak: weak.clone(),
            pid,
            id,
            no_retry: opts.progress_mode.contains(ProgressMode::NO_RETRY),
            poll,
            listener: Mutex::new(listener),
            last_accept: Mutex::new(None),
            // Connection 0 names the self notifier's FIFO.
            next_conn_id: AtomicU32::new(1),
            arena,
            self_addr: OnceLock::new(),
            accepted: SpinMutex::new(Vec::new()),
            poll_addrs: SpinMutex::new(Vec::new()),
            lookup_ops: SpinMutex::new(Vec::new()),
            unexpected_ops: SpinMutex::new(VecDeque::new()),
            expected_ops: SpinMutex::new(VecDeque::new()),
            retry_ops: SpinMutex::new(VecDeque::new()),
            unexpected_msgs: SpinMutex::new(VecDeque::new()),
            instance_dir,
            finalized: AtomicBool::new(false),
        });

        // Self address: notifier only, no ring pair.
        let self_addr = Arc::new(SmAddr::new(engine.weak.clone(), pid, id, true, false));
        let notifier = Notifier::new(&engine.instance_dir, &paths::fifo_name(0, 's'))?;
        engine.poll.add(
            notifier.as_raw_fd(),
            Arc::new(SmEvent {
                engine: engine.weak.clone(),
                addr: Some(Arc::clone(&self_addr)),
                kind: EventKind::Notify,
            }),
        )?;
        self_addr.local_notify.set(notifier).ok();
        if let Some(arena) = &engine.arena {
            self_addr.copy_buf.set(Arc::clone(arena)).ok();
        }
        engine.self_addr.set(self_addr).ok();

        if let Some(l) = &*engine.listener.lock().unwrap() {
            engine.poll.add(
                l.as_raw_fd(),
                Arc::new(SmEvent {
                    engine: engine.weak.clone(),
                    addr: None,
                    kind: EventKind::Accept,
                }),
            )?;
        }

        log::debug!("sm engine up: {}/{} (listen {})", pid, id, listen);
        Ok(engine)
    }

    fn self_addr(&self) -> &Arc<SmAddr> {
        self.self_addr.get().expect("engine initialized")
    }

    /// Wake our own progress loop (completions were appended outside it).
    fn wake_self(&self) {
        if let Some(addr) = self.self_addr.get() {
            if let Some(n) = addr.local_notify.get() {
                if let Err(e) = n.set() {
                    log::warn!("self notifier set failed: {e}");
                }
            }
        }
    }

    /// Map a user-supplied address back to our own record.
    fn resolve(&self, addr: &Addr) -> NaResult<Arc<SmAddr>> {
        let target = Arc::as_ptr(addr) as *const ();
        let this = self.self_addr();
        if Arc::as_ptr(this) as *const () == target {
            return Ok(Arc::clone(this));
        }
        for a in self.poll_addrs.lock().iter() {
            if Arc::as_ptr(a) as *const () == target {
                return Ok(Arc::clone(a));
            }
        }
        for a in self.accepted.lock().iter() {
            if Arc::as_ptr(a) as *const () == target {
                return Ok(Arc::clone(a));
            }
        }
        Err(NaError::InvalidArg("address unknown to this class"))
    }

    fn addr_ptr_eq(bound: &Addr, candidate: &Arc<SmAddr>) -> bool {
        Arc::as_ptr(bound) as *const () == Arc::as_ptr(candidate) as *const ()
    }

    /// Publish an address to the user: one more protocol reference.
    fn publish(addr: &Arc<SmAddr>) -> Addr {
        addr.retain();
        let published: Addr = addr.clone();
        published
    }

    // -- completion plumbing ------------------------------------------------

    /// Move an op to its completion: take its bound state, flip status to
    /// COMPLETED, and hand the record to the bound context. The release
    /// callback drops the address binding and retires the op after the
    /// user callback ran.
    fn complete_op(&self, op: &OpId, result: NaResult<()>, info: CallbackInfo) {
        let (ctx, callback, bound_addr) = {
            let mut st = op.inner.state.lock();
            (st.context.take(), st.callback.take(), st.addr.take())
        };
        op.mark_completed();

        let release_op = op.clone();
        let release: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(a) = bound_addr {
                a.release();
            }
            release_op.retire();
        });

        match ctx {
            Some(ctx) => ctx.completion_add(Box::new(Completion {
                result,
                info,
                callback,
                release: Some(release),
            })),
            None => {
                // Op raced finalize; run the release inline so refcounts
                // still balance.
                log::warn!("completion without a bound context dropped");
                release();
            }
        }
    }

    fn canceled_info(kind: OpKind) -> CallbackInfo {
        match kind {
            OpKind::Lookup => CallbackInfo::Lookup { addr: None },
            OpKind::SendUnexpected | OpKind::None => CallbackInfo::SendUnexpected,
            OpKind::RecvUnexpected => CallbackInfo::RecvUnexpected {
                source: None,
                tag: 0,
                data: Vec::new(),
            },
            OpKind::SendExpected => CallbackInfo::SendExpected,
            OpKind::RecvExpected => CallbackInfo::RecvExpected { data: Vec::new() },
            OpKind::Put => CallbackInfo::Put,
            OpKind::Get => CallbackInfo::Get,
        }
    }

    fn complete_canceled(&self, op: &OpId) {
        let kind = op.inner.state.lock().kind;
        self.complete_op(op, Err(NaError::Canceled), Self::canceled_info(kind));
    }

    // -- post paths ---------------------------------------------------------

    fn post_send(&self, op: &OpId, dest: &Addr, kind: MsgKind) -> NaResult<()> {
        let dest = self.resolve(dest)?;
        if dest.self_flag {
            return self.self_send(op, kind);
        }

        let (payload_len, tag) = {
            let st = op.inner.state.lock();
            (st.payload.len(), st.tag)
        };
        if payload_len > COPY_SIZE {
            return Err(NaError::InvalidArg("payload exceeds msg_size_max"));
        }

        let arena = dest.copy_buf.get().ok_or(NaError::Fault)?;
        let slot = {
            let st = op.inner.state.lock();
            arena.reserve_and_copy(&st.payload)
        };
        match slot {
            Some(slot) => self.finish_send(op, &dest, kind, slot, payload_len as u16, tag),
            None if self.no_retry => Err(NaError::Again),
            None => {
                log::trace!("copy arena exhausted; queueing send for retry");
                op.mark_queued();
                self.retry_ops.lock().push_back(op.clone());
                Ok(())
            }
        }
    }

    /// Publish the header, wake the peer, and complete locally.
    fn finish_send(
        &self,
        op: &OpId,
        dest: &Arc<SmAddr>,
        kind: MsgKind,
        slot: u8,
        size: u16,
        tag: u32,
    ) -> NaResult<()> {
        let ring = dest.tx_ring.get().ok_or(NaError::Fault)?;
        let header = MsgHeader {
            kind,
            slot,
            size,
            tag,
        }
        .pack();
        if !ring.push(header) {
            // Transient: the peer has not yet cleared a consumed slot.
            dest.copy_buf.get().ok_or(NaError::Fault)?.release(slot);
            if self.no_retry {
                return Err(NaError::Again);
            }
            op.mark_queued();
            self.retry_ops.lock().push_back(op.clone());
            return Ok(());
        }

        if let Some(n) = dest.remote_notify.get() {
            n.set()?;
        }
        let info = match kind {
            MsgKind::SendUnexpected => CallbackInfo::SendUnexpected,
            MsgKind::SendExpected => CallbackInfo::SendExpected,
        };
        self.complete_op(op, Ok(()), info);
        self.wake_self();
        Ok(())
    }

    /// Loopback send: no ring or arena traffic, straight to the local
    /// matching queues.
    fn self_send(&self, op: &OpId, kind: MsgKind) -> NaResult<()> {
        let (payload, tag) = {
            let st = op.inner.state.lock();
            (st.payload.clone(), st.tag)
        };
        if payload.len() > COPY_SIZE {
            return Err(NaError::InvalidArg("payload exceeds msg_size_max"));
        }
        let this = Arc::clone(self.self_addr());

        match kind {
            MsgKind::SendUnexpected => {
                self.complete_op(op, Ok(()), CallbackInfo::SendUnexpected);
                self.deliver_unexpected(&this, tag, payload);
            }
            MsgKind::SendExpected => {
                // Expected messages must be pre-posted, the loopback path
                // included.
                let recv = self.take_expected(&this, tag).ok_or(NaError::Fault)?;
                self.complete_op(op, Ok(()), CallbackInfo::SendExpected);
                self.complete_expected_recv(recv, payload);
            }
        }
        self.wake_self();
        Ok(())
    }

    fn post_recv_unexpected(&self, op: &OpId) -> NaResult<()> {
        let msg = self.unexpected_msgs.lock().pop_front();
        match msg {
            Some(msg) => {
                self.complete_unexpected_recv(op, msg);
                self.wake_self();
            }
            None => {
                op.mark_queued();
                self.unexpected_ops.lock().push_back(op.clone());
            }
        }
        Ok(())
    }

    fn post_recv_expected(&self, op: &OpId, source: &Addr) -> NaResult<()> {
        // Validate the source now; matching happens at arrival time.
        self.resolve(source)?;
        op.mark_queued();
        self.expected_ops.lock().push_back(op.clone());
        Ok(())
    }

    fn post_rma(&self, op: &OpId, args: &RmaArgs<'_>, dir: CopyDirection) -> NaResult<()> {
        let peer = self.resolve(args.peer)?;
        let allowed = match dir {
            CopyDirection::Write => args.remote.access().writable(),
            CopyDirection::Read => args.remote.access().readable(),
        };
        if !allowed {
            return Err(NaError::Permission);
        }

        let local = args.local.translate(args.local_offset, args.length)?;
        let remote = args.remote.translate(args.remote_offset, args.length)?;
        let n = platform::vm_copy(peer.pid(), &local, &remote, dir)?;

        let info = match dir {
            CopyDirection::Write => CallbackInfo::Put,
            CopyDirection::Read => CallbackInfo::Get,
        };
        let result = if n as u64 == args.length {
            Ok(())
        } else {
            Err(NaError::MsgSize {
                expected: args.length as usize,
                actual: n,
            })
        };
        self.complete_op(op, result, info);
        self.wake_self();
        Ok(())
    }

    // -- arrival matching ---------------------------------------------------

    /// Pop the next live unexpected-recv op, completing canceled ones on
    /// the way out.
    fn take_unexpected_op(&self) -> Option<OpId> {
        loop {
            let op = self.unexpected_ops.lock().pop_front()?;
            if op.is_canceled() {
                self.complete_canceled(&op);
                continue;
            }
            op.clear_queued();
            return Some(op);
        }
    }

    /// First live expected-recv op posted for `(source, tag)`, FIFO.
    fn take_expected(&self, source: &Arc<SmAddr>, tag: u32) -> Option<OpId> {
        let mut canceled = Vec::new();
        let found = {
            let mut queue = self.expected_ops.lock();
            let mut found = None;
            let mut idx = 0;
            while idx < queue.len() {
                if queue[idx].is_canceled() {
                    canceled.push(queue.remove(idx).unwrap());
                    continue;
                }
                let matches = {
                    let st = queue[idx].inner.state.lock();
                    st.tag == tag
                        && st
                            .addr
                            .as_ref()
                            .map_or(false, |a| Self::addr_ptr_eq(a, source))
                };
                if matches {
                    found = queue.remove(idx);
                    break;
                }
                idx += 1;
            }
            found
        };

        for op in canceled {
            self.complete_canceled(&op);
        }
        if let Some(op) = &found {
            op.clear_queued();
        }
        found
    }

    fn deliver_unexpected(&self, source: &Arc<SmAddr>, tag: u32, data: Vec<u8>) {
        let msg = UnexpectedMsg {
            source: Arc::clone(source),
            tag,
            data,
        };
        match self.take_unexpected_op() {
            Some(op) => self.complete_unexpected_recv(&op, msg),
            None => self.unexpected_msgs.lock().push_back(msg),
        }
    }

    fn complete_unexpected_recv(&self, op: &OpId, msg: UnexpectedMsg) {
        let max_len = op.inner.state.lock().max_len;
        if msg.data.len() > max_len {
            self.complete_op(
                op,
                Err(NaError::Overflow {
                    needed: msg.data.len(),
                    capacity: max_len,
                }),
                CallbackInfo::RecvUnexpected {
                    source: Some(Self::publish(&msg.source)),
                    tag: msg.tag,
                    data: Vec::new(),
                },
            );
            return;
        }
        self.complete_op(
            op,
            Ok(()),
            CallbackInfo::RecvUnexpected {
                source: Some(Self::publish(&msg.source)),
                tag: msg.tag,
                data: msg.data,
            },
        );
    }

    fn complete_expected_recv(&self, op: OpId, data: Vec<u8>) {
        let max_len = op.inner.state.lock().max_len;
        if data.len() > max_len {
            self.complete_op(
                &op,
                Err(NaError::Overflow {
                    needed: data.len(),
                    capacity: max_len,
                }),
                CallbackInfo::RecvExpected { data: Vec::new() },
            );
            return;
        }
        self.complete_op(&op, Ok(()), CallbackInfo::RecvExpected { data });
    }

    // -- progress callbacks -------------------------------------------------

    fn on_accept(&self) -> NaResult<bool> {
        {
            let mut last = self.last_accept.lock().unwrap();
            if let Some(t) = *last {
                // Smooth thundering herds; the listener stays readable and
                // the next progress call retries.
                if t.elapsed().as_millis() < paths::ACCEPT_INTERVAL_MS as u128 {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }

        let stream = {
            let guard = self.listener.lock().unwrap();
            let Some(listener) = &*guard else {
                return Ok(false);
            };
            match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(NaError::Protocol(e)),
            }
        };
        stream.set_nonblocking(true).map_err(NaError::Protocol)?;

        let peer = Arc::new(SmAddr::new(self.weak.clone(), 0, 0, false, true));
        debug_assert_eq!(peer.sock_progress.load(Ordering::Relaxed), SOCK_ADDR_INFO);
        let fd = stream.as_raw_fd();
        *peer.sock.lock().unwrap() = Some(stream);
        self.poll.add(
            fd,
            Arc::new(SmEvent {
                engine: self.weak.clone(),
                addr: Some(peer),
                kind: EventKind::Sock,
            }),
        )?;
        log::debug!("accepted connection on {}/{}", self.pid, self.id);
        Ok(true)
    }

    fn on_sock(&self, peer: &Arc<SmAddr>) -> NaResult<bool> {
        match peer.sock_progress.load(Ordering::Acquire) {
            SOCK_ADDR_INFO => self.sock_addr_info(peer),
            SOCK_CONN_ID => self.sock_conn_id(peer),
            SOCK_DONE => {
                // Only EOF can arrive on an established socket.
                let mut byte = [0u8; 1];
                let closed = {
                    let guard = peer.sock.lock().unwrap();
                    match &*guard {
                        Some(sock) => !matches!(
                            (&*sock).read(&mut byte),
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
                        ),
                        None => false,
                    }
                };
                if closed {
                    self.peer_error(peer);
                    return Ok(true);
                }
                Ok(false)
            }
            _ => Err(NaError::Fault),
        }
    }

    /// Server side: the peer told us who it is. Build the shared pair,
    /// pass the notifiers back, and promote the address.
    fn sock_addr_info(&self, peer: &Arc<SmAddr>) -> NaResult<bool> {
        let (pid, id) = {
            let guard = peer.sock.lock().unwrap();
            let sock = guard.as_ref().ok_or(NaError::Fault)?;
            conn::recv_addr_info(sock)?
        };
        peer.pid.store(pid, Ordering::Release);
        peer.id.store(id, Ordering::Release);

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        peer.conn_id.store(conn_id, Ordering::Release);

        let tx = SmRing::create(&paths::ring_name(self.pid, self.id, conn_id, 's'))?;
        let rx = SmRing::create(&paths::ring_name(self.pid, self.id, conn_id, 'r'))?;
        let local = Notifier::new(&self.instance_dir, &paths::fifo_name(conn_id, 's'))?;
        let remote = Notifier::new(&self.instance_dir, &paths::fifo_name(conn_id, 'r'))?;

        {
            let guard = peer.sock.lock().unwrap();
            let sock = guard.as_ref().ok_or(NaError::Fault)?;
            conn::send_conn_id(sock, conn_id, [local.as_raw_fd(), remote.as_raw_fd()])?;
        }

        self.poll.add(
            local.as_raw_fd(),
            Arc::new(SmEvent {
                engine: self.weak.clone(),
                addr: Some(Arc::clone(peer)),
                kind: EventKind::Notify,
            }),
        )?;

        peer.tx_ring.set(tx).ok();
        peer.rx_ring.set(rx).ok();
        peer.local_notify.set(local).ok();
        peer.remote_notify.set(remote).ok();
        let arena = self.arena.as_ref().ok_or(NaError::Fault)?;
        peer.copy_buf.set(Arc::clone(arena)).ok();
        peer.sock_progress.store(SOCK_DONE, Ordering::Release);

        self.accepted.lock().push(Arc::clone(peer));
        self.poll_addrs.lock().push(Arc::clone(peer));
        log::debug!("established server side of conn {} to {}/{}", conn_id, pid, id);
        Ok(true)
    }

    /// Client side: the server answered with the connection id and the
    /// notifier pair. Map the rings and complete the pending lookup.
    fn sock_conn_id(&self, peer: &Arc<SmAddr>) -> NaResult<bool> {
        let (conn_id, mut fds) = {
            let guard = peer.sock.lock().unwrap();
            let sock = guard.as_ref().ok_or(NaError::Fault)?;
            conn::recv_conn_id(sock)?
        };
        peer.conn_id.store(conn_id, Ordering::Release);

        // The fds arrive in the server's order [local, remote]; ours is
        // the inverse.
        let remote_fd = fds.remove(0);
        let local_fd = fds.remove(0);
        let local = Notifier::from_fd(local_fd);
        let remote = Notifier::from_fd(remote_fd);

        // Ring names are tied to the server's identity; 's'/'r' swap so
        // our send ring is the server's recv ring.
        let tx = SmRing::open(&paths::ring_name(peer.pid(), peer.id(), conn_id, 'r'))?;
        let rx = SmRing::open(&paths::ring_name(peer.pid(), peer.id(), conn_id, 's'))?;

        self.poll.add(
            local.as_raw_fd(),
            Arc::new(SmEvent {
                engine: self.weak.clone(),
                addr: Some(Arc::clone(peer)),
                kind: EventKind::Notify,
            }),
        )?;

        peer.tx_ring.set(tx).ok();
        peer.rx_ring.set(rx).ok();
        peer.local_notify.set(local).ok();
        peer.remote_notify.set(remote).ok();
        peer.sock_progress.store(SOCK_DONE, Ordering::Release);

        self.poll_addrs.lock().push(Arc::clone(peer));

        // Complete the lookup that started this connection.
        let op = {
            let mut lookups = self.lookup_ops.lock();
            let pos = lookups.iter().position(|(_, a)| Arc::ptr_eq(a, peer));
            pos.map(|i| lookups.remove(i).0)
        };
        if let Some(op) = op {
            op.clear_queued();
            if op.is_canceled() {
                self.complete_canceled(&op);
            } else {
                // The creation reference transfers to the user through
                // the completion.
                let published: Addr = peer.clone();
                self.complete_op(&op, Ok(()), CallbackInfo::Lookup {
                    addr: Some(published),
                });
            }
        }
        log::debug!(
            "established client side of conn {} to {}/{}",
            conn_id,
            peer.pid(),
            peer.id()
        );
        Ok(true)
    }

    fn on_notify(&self, addr: &Arc<SmAddr>) -> NaResult<bool> {
        let signaled = match addr.local_notify.get() {
            Some(n) => n.get()?,
            None => false,
        };
        if addr.self_flag {
            // Nothing to drain beyond the event itself: the completions
            // that triggered it are already queued.
            return Ok(signaled);
        }

        let Some(ring) = addr.rx_ring.get() else {
            return Ok(false);
        };
        let mut progressed = false;
        if let Some(word) = ring.pop() {
            let header = MsgHeader::unpack(word)?;
            let arena = addr.copy_buf.get().ok_or(NaError::Fault)?;
            let data = arena.copy_out_and_release(header.slot, header.size as usize);
            // A freed slot may unblock the peer's retry queue.
            if let Some(n) = addr.remote_notify.get() {
                n.set()?;
            }
            match header.kind {
                MsgKind::SendUnexpected => {
                    self.deliver_unexpected(addr, header.tag, data);
                }
                MsgKind::SendExpected => {
                    let Some(op) = self.take_expected(addr, header.tag) else {
                        log::error!(
                            "expected message (tag {}) with no posted receive",
                            header.tag
                        );
                        return Err(NaError::Fault);
                    };
                    self.complete_expected_recv(op, data);
                }
            }
            progressed = true;

            // One header per dispatch; re-arm for the rest.
            if !ring.is_empty() {
                if let Some(n) = addr.local_notify.get() {
                    n.set()?;
                }
            }
        }
        Ok(progressed)
    }

    /// Replay queued sends in FIFO order until the arena runs dry again.
    fn retry_sweep(&self) -> NaResult<bool> {
        let mut progressed = false;
        loop {
            let Some(op) = self.retry_ops.lock().pop_front() else {
                break;
            };
            if op.is_canceled() {
                self.complete_canceled(&op);
                progressed = true;
                continue;
            }

            let (bound, kind, len, tag) = {
                let st = op.inner.state.lock();
                let bound = st.addr.clone().ok_or(NaError::Fault)?;
                let kind = match st.kind {
                    OpKind::SendUnexpected => MsgKind::SendUnexpected,
                    OpKind::SendExpected => MsgKind::SendExpected,
                    _ => return Err(NaError::Fault),
                };
                (bound, kind, st.payload.len() as u16, st.tag)
            };
            let dest = self.resolve(&bound)?;
            let arena = dest.copy_buf.get().ok_or(NaError::Fault)?;
            let slot = {
                let st = op.inner.state.lock();
                arena.reserve_and_copy(&st.payload)
            };
            match slot {
                Some(slot) => {
                    op.clear_queued();
                    self.finish_send(&op, &dest, kind, slot, len, tag)?;
                    progressed = true;
                }
                None => {
                    self.retry_ops.lock().push_front(op);
                    break;
                }
            }
        }
        Ok(progressed)
    }

    // -- failure and teardown ----------------------------------------------

    /// A peer went away: cancel everything bound to it and drop the
    /// record's resources.
    fn peer_error(&self, addr: &Arc<SmAddr>) {
        log::warn!("peer {}/{} disconnected", addr.pid(), addr.id());

        let mut doomed = Vec::new();
        {
            let mut expected = self.expected_ops.lock();
            let mut idx = 0;
            while idx < expected.len() {
                let bound = {
                    let st = expected[idx].inner.state.lock();
                    st.addr.as_ref().map_or(false, |a| Self::addr_ptr_eq(a, addr))
                };
                if bound {
                    doomed.push(expected.remove(idx).unwrap());
                } else {
                    idx += 1;
                }
            }
        }
        {
            let mut retry = self.retry_ops.lock();
            let mut idx = 0;
            while idx < retry.len() {
                let bound = {
                    let st = retry[idx].inner.state.lock();
                    st.addr.as_ref().map_or(false, |a| Self::addr_ptr_eq(a, addr))
                };
                if bound {
                    doomed.push(retry.remove(idx).unwrap());
                } else {
                    idx += 1;
                }
            }
        }
        {
            let mut lookups = self.lookup_ops.lock();
            let mut idx = 0;
            while idx < lookups.len() {
                if Arc::ptr_eq(&lookups[idx].1, addr) {
                    doomed.push(lookups.remove(idx).0);
                } else {
                    idx += 1;
                }
            }
        }
        for op in doomed {
            op.set_canceled();
            op.clear_queued();
            self.complete_canceled(&op);
        }

        addr.teardown();
    }

    /// Drop every engine-side trace of `addr`: poll registrations and
    /// queue membership. Called exactly once per address.
    pub(crate) fn addr_teardown(&self, addr: &SmAddr) {
        if let Some(n) = addr.local_notify.get() {
            let _ = self.poll.remove(n.as_raw_fd());
        }
        {
            let guard = addr.sock.lock().unwrap();
            if let Some(sock) = &*guard {
                let _ = self.poll.remove(sock.as_raw_fd());
            }
        }
        let target = addr as *const SmAddr;
        self.poll_addrs.lock().retain(|a| Arc::as_ptr(a) != target);
        self.accepted.lock().retain(|a| Arc::as_ptr(a) != target);
        self.lookup_ops
            .lock()
            .retain(|(_, a)| Arc::as_ptr(a) != target);
    }

    fn shutdown(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let accepted: Vec<_> = std::mem::take(&mut *self.accepted.lock());
        for peer in accepted {
            self.peer_error(&peer);
        }
        let polled: Vec<_> = std::mem::take(&mut *self.poll_addrs.lock());
        for peer in polled {
            peer.teardown();
        }
        let lookups: Vec<_> = std::mem::take(&mut *self.lookup_ops.lock());
        for (op, peer) in lookups {
            op.set_canceled();
            op.clear_queued();
            self.complete_canceled(&op);
            peer.teardown();
        }
        for queue in [&self.unexpected_ops, &self.expected_ops, &self.retry_ops] {
            let ops = std::mem::take(&mut *queue.lock());
            for op in ops {
                op.set_canceled();
                op.clear_queued();
                self.complete_canceled(&op);
            }
        }
        self.unexpected_msgs.lock().clear();

        if let Some(listener) = self.listener.lock().unwrap().take() {
            let _ = self.poll.remove(listener.as_raw_fd());
        }
        if let Some(addr) = self.self_addr.get() {
            addr.teardown();
        }

        let _ = std::fs::remove_dir_all(&self.instance_dir);
        // Prune now-empty parents up to the per-user root.
        if let Some(parent) = self.instance_dir.parent() {
            let _ = std::fs::remove_dir(parent);
        }
        let _ = std::fs::remove_dir(paths::tmp_root());
        log::debug!("sm engine down: {}/{}", self.pid, self.id);
    }
}

impl Drop for SmEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Plugin surface
// ---------------------------------------------------------------------------

struct SmPlugin {
    engine: Option<Arc<SmEngine>>,
}

impl SmPlugin {
    fn engine(&self) -> NaResult<&Arc<SmEngine>> {
        self.engine.as_ref().ok_or(NaError::Fault)
    }

    fn sm_addr<'a>(&self, addr: &'a Addr) -> NaResult<&'a SmAddr> {
        addr.as_any()
            .downcast_ref::<SmAddr>()
            .ok_or(NaError::InvalidArg("address from another plugin"))
    }
}

impl Plugin for SmPlugin {
    fn initialize(
        &mut self,
        _protocol: &str,
        host: Option<&str>,
        listen: bool,
        opts: &InitOpts,
    ) -> NaResult<()> {
        let pid = std::process::id();
        let id = match host {
            Some(host) => {
                let (host_pid, host_id) = parse_host(host)?;
                if let Some(p) = host_pid {
                    if p != pid {
                        return Err(NaError::InvalidArg("host pid is not this process"));
                    }
                }
                host_id
            }
            None => (NEXT_AUTO_ID.fetch_add(1, Ordering::AcqRel) & 0xff) as u8,
        };
        self.engine = Some(SmEngine::new(pid, id, listen, opts)?);
        Ok(())
    }

    fn finalize(&mut self) -> NaResult<()> {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        Ok(())
    }

    fn addr_lookup(&self, _ctx: &Arc<Context>, op: &OpId, host: &str) -> NaResult<()> {
        let engine = self.engine()?;
        let (pid, id) = match parse_host(host)? {
            (Some(pid), id) => (pid, id),
            (None, _) => return Err(NaError::InvalidArg("lookup host needs pid/id")),
        };

        if pid == engine.pid && id == engine.id {
            let this = engine.self_addr();
            engine.complete_op(
                op,
                Ok(()),
                CallbackInfo::Lookup {
                    addr: Some(SmEngine::publish(this)),
                },
            );
            engine.wake_self();
            return Ok(());
        }

        let arena = CopyBuf::open(&paths::copy_buf_name(pid, id)).map_err(|e| {
            log::debug!("no copy arena for {pid}/{id}: {e}");
            NaError::ProtoNoSupport
        })?;
        let sock = UnixStream::connect(paths::sock_path(pid, id)).map_err(|e| {
            log::debug!("no listener at {pid}/{id}: {e}");
            NaError::ProtoNoSupport
        })?;
        sock.set_nonblocking(true).map_err(NaError::Protocol)?;
        conn::send_addr_info(&sock, engine.pid, engine.id)?;

        let peer = Arc::new(SmAddr::new(engine.weak.clone(), pid, id, false, false));
        peer.sock_progress.store(SOCK_CONN_ID, Ordering::Release);
        peer.copy_buf.set(Arc::new(arena)).ok();
        let fd = sock.as_raw_fd();
        *peer.sock.lock().unwrap() = Some(sock);
        engine.poll.add(
            fd,
            Arc::new(SmEvent {
                engine: engine.weak.clone(),
                addr: Some(Arc::clone(&peer)),
                kind: EventKind::Sock,
            }),
        )?;

        op.mark_queued();
        engine.lookup_ops.lock().push((op.clone(), peer));
        Ok(())
    }

    fn addr_self(&self) -> NaResult<Addr> {
        let engine = self.engine()?;
        Ok(SmEngine::publish(engine.self_addr()))
    }

    fn addr_free(&self, addr: &Addr) -> NaResult<()> {
        self.sm_addr(addr)?;
        addr.release();
        Ok(())
    }

    fn addr_to_string(&self, addr: &Addr) -> NaResult<String> {
        let sm = self.sm_addr(addr)?;
        Ok(format!("sm://{}", sm.host_string()))
    }

    fn msg_size_max(&self) -> usize {
        COPY_SIZE
    }

    fn unexpected_size_max(&self) -> usize {
        COPY_SIZE
    }

    fn msg_send_unexpected(
        &self,
        _ctx: &Arc<Context>,
        op: &OpId,
        dest: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        self.engine()?.post_send(op, dest, MsgKind::SendUnexpected)
    }

    fn msg_recv_unexpected(&self, _ctx: &Arc<Context>, op: &OpId) -> NaResult<()> {
        self.engine()?.post_recv_unexpected(op)
    }

    fn msg_send_expected(
        &self,
        _ctx: &Arc<Context>,
        op: &OpId,
        dest: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        self.engine()?.post_send(op, dest, MsgKind::SendExpected)
    }

    fn msg_recv_expected(
        &self,
        _ctx: &Arc<Context>,
        op: &OpId,
        source: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        self.engine()?.post_recv_expected(op, source)
    }

    fn put(&self, _ctx: &Arc<Context>, op: &OpId, args: &RmaArgs<'_>) -> NaResult<()> {
        self.engine()?.post_rma(op, args, CopyDirection::Write)
    }

    fn get(&self, _ctx: &Arc<Context>, op: &OpId, args: &RmaArgs<'_>) -> NaResult<()> {
        self.engine()?.post_rma(op, args, CopyDirection::Read)
    }

    fn progress(&self, timeout_ms: u32) -> NaResult<bool> {
        let engine = self.engine()?;
        let mut progressed = engine.poll.wait(timeout_ms)?;
        if !engine.no_retry {
            progressed |= engine.retry_sweep()?;
        }
        Ok(progressed)
    }

    fn cancel(&self, op: &OpId) -> NaResult<()> {
        let engine = self.engine()?;
        if op.is_completed() {
            return Ok(());
        }
        if !op.set_canceled() {
            // Completion won the race.
            return Ok(());
        }
        if !op.is_queued() {
            // In flight inside the engine; the processing side surfaces
            // the canceled completion.
            return Ok(());
        }

        // Remove from whichever queue holds it. Whoever takes it out of
        // the queue owns the canceled completion.
        let found = {
            let mut queue = engine.unexpected_ops.lock();
            let pos = queue.iter().position(|o| o.same_op(op));
            pos.and_then(|i| queue.remove(i))
        };
        let found = found.or_else(|| {
            let mut queue = engine.expected_ops.lock();
            let pos = queue.iter().position(|o| o.same_op(op));
            pos.and_then(|i| queue.remove(i))
        });
        let found = found.or_else(|| {
            let mut queue = engine.retry_ops.lock();
            let pos = queue.iter().position(|o| o.same_op(op));
            pos.and_then(|i| queue.remove(i))
        });
        let found = found.or_else(|| {
            let mut lookups = engine.lookup_ops.lock();
            let pos = lookups.iter().position(|(o, _)| o.same_op(op));
            pos.map(|i| {
                let (op, peer) = lookups.remove(i);
                // Abort the half-open connection.
                peer.teardown();
                op
            })
        });

        if let Some(op) = found {
            op.clear_queued();
            engine.complete_canceled(&op);
            engine.wake_self();
        }
        Ok(())
    }

    fn try_wait(&self) -> bool {
        let Ok(engine) = self.engine() else {
            return true;
        };
        let addrs = engine.poll_addrs.lock();
        addrs
            .iter()
            .all(|a| a.rx_ring.get().map_or(true, |r| r.is_empty()))
    }
}

fn parse_host(host: &str) -> NaResult<(Option<u32>, u8)> {
    match host.split_once('/') {
        Some((pid, id)) => {
            let pid = pid
                .parse::<u32>()
                .map_err(|_| NaError::InvalidArg("malformed pid in host"))?;
            let id = id
                .parse::<u8>()
                .map_err(|_| NaError::InvalidArg("malformed instance id in host"))?;
            Ok((Some(pid), id))
        }
        None => {
            let id = host
                .parse::<u8>()
                .map_err(|_| NaError::InvalidArg("malformed instance id in host"))?;
            Ok((None, id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_check() {
        assert!(check_protocol("sm"));
        assert!(!check_protocol("tcp"));
        assert!(!check_protocol(""));
    }

    #[test]
    fn host_parsing() {
        assert_eq!(parse_host("123/4").unwrap(), (Some(123), 4));
        assert_eq!(parse_host("9").unwrap(), (None, 9));
        assert!(parse_host("abc/0").is_err());
        assert!(parse_host("1/999").is_err());
        assert!(parse_host("").is_err());
    }
}

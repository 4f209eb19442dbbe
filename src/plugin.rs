// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Plugin dispatch and class lifecycle.
//
// A static, order-significant table maps address strings to transport
// plugins. `Class::initialize` parses the info string once, selects the
// plugin (first match wins when no class is explicit), and drives the
// plugin's initialize. The class is immutable after initialize returns.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::addr_string;
use crate::context::{Callback, Context};
use crate::error::{NaError, NaResult};
use crate::mem_handle::MemHandle;
use crate::op_id::{OpId, OpKind, OpPool, OpState};
use crate::sm;

/// A transport-level peer address. Clones of the `Arc` share one protocol
/// refcount; the underlying resources are torn down when it reaches zero.
pub trait NetAddr: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    /// Whether this is the local endpoint's own address.
    fn is_self_addr(&self) -> bool;
    /// Take one protocol reference.
    fn retain(&self);
    /// Drop one protocol reference, tearing down at zero.
    fn release(&self);
}

pub type Addr = Arc<dyn NetAddr>;

/// Progress-mode bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressMode(u32);

impl ProgressMode {
    /// Progress never blocks in the OS poll primitive.
    pub const NO_BLOCK: ProgressMode = ProgressMode(1);
    /// Exhausted resources fail with `Again` instead of queueing a retry.
    pub const NO_RETRY: ProgressMode = ProgressMode(2);

    pub fn contains(self, other: ProgressMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ProgressMode {
    type Output = ProgressMode;

    fn bitor(self, rhs: ProgressMode) -> ProgressMode {
        ProgressMode(self.0 | rhs.0)
    }
}

/// Options for `Class::initialize_opts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOpts {
    pub progress_mode: ProgressMode,
}

/// Arguments of a one-sided transfer.
pub struct RmaArgs<'a> {
    pub local: &'a MemHandle,
    pub local_offset: u64,
    pub remote: &'a MemHandle,
    pub remote_offset: u64,
    pub length: u64,
    pub peer: &'a Addr,
}

/// Transport plugin entry points.
///
/// Optional entry points default to `OpNotSupported`, which is surfaced
/// directly to the caller.
pub trait Plugin: Send + Sync {
    fn initialize(
        &mut self,
        protocol: &str,
        host: Option<&str>,
        listen: bool,
        opts: &InitOpts,
    ) -> NaResult<()>;

    fn finalize(&mut self) -> NaResult<()> {
        Ok(())
    }

    fn addr_lookup(&self, _ctx: &Arc<Context>, _op: &OpId, _host: &str) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn addr_self(&self) -> NaResult<Addr> {
        Err(NaError::OpNotSupported)
    }

    fn addr_free(&self, _addr: &Addr) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    /// String form of an address, without any class prefix.
    fn addr_to_string(&self, _addr: &Addr) -> NaResult<String> {
        Err(NaError::OpNotSupported)
    }

    fn msg_size_max(&self) -> usize {
        0
    }

    fn unexpected_size_max(&self) -> usize {
        0
    }

    fn msg_send_unexpected(
        &self,
        _ctx: &Arc<Context>,
        _op: &OpId,
        _dest: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_recv_unexpected(&self, _ctx: &Arc<Context>, _op: &OpId) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_send_expected(
        &self,
        _ctx: &Arc<Context>,
        _op: &OpId,
        _dest: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_recv_expected(
        &self,
        _ctx: &Arc<Context>,
        _op: &OpId,
        _source: &Addr,
        _tag: u32,
    ) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn put(&self, _ctx: &Arc<Context>, _op: &OpId, _args: &RmaArgs<'_>) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    fn get(&self, _ctx: &Arc<Context>, _op: &OpId, _args: &RmaArgs<'_>) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    /// Drive the transport for up to `timeout_ms`. Returns whether any
    /// useful work was performed.
    fn progress(&self, timeout_ms: u32) -> NaResult<bool>;

    fn cancel(&self, _op: &OpId) -> NaResult<()> {
        Err(NaError::OpNotSupported)
    }

    /// Whether the transport holds no pending inbound work.
    fn try_wait(&self) -> bool {
        true
    }
}

/// One row of the static plugin table.
pub struct PluginEntry {
    pub class_name: &'static str,
    pub check_protocol: fn(&str) -> bool,
    pub new_plugin: fn() -> Box<dyn Plugin>,
    /// Whether `addr_to_string` output should carry a `<class>+` prefix.
    pub prepend_class_prefix_in_addr_string: bool,
}

/// Static, order-significant plugin table. The first entry wins when no
/// class is explicit and several protocols would match; keeping the
/// shared-memory plugin first routes local-only URIs there.
pub static PLUGIN_TABLE: &[PluginEntry] = &[PluginEntry {
    class_name: "sm",
    check_protocol: sm::check_protocol,
    new_plugin: sm::new_plugin,
    prepend_class_prefix_in_addr_string: true,
}];

/// An initialized transport plugin instance.
pub struct Class {
    plugin: Box<dyn Plugin>,
    entry: &'static PluginEntry,
    protocol: String,
    listen: bool,
    progress_mode: ProgressMode,
    ops: OpPool,
}

impl Class {
    pub fn initialize(info: &str, listen: bool) -> NaResult<Class> {
        Self::initialize_opts(info, listen, InitOpts::default())
    }

    pub fn initialize_opts(info: &str, listen: bool, opts: InitOpts) -> NaResult<Class> {
        let parsed = addr_string::parse(info)?;

        for entry in PLUGIN_TABLE {
            match &parsed.class {
                Some(class) => {
                    if class != entry.class_name {
                        continue;
                    }
                    if !(entry.check_protocol)(&parsed.protocol) {
                        return Err(NaError::ProtoNoSupport);
                    }
                }
                None => {
                    if !(entry.check_protocol)(&parsed.protocol) {
                        continue;
                    }
                }
            }

            let mut plugin = (entry.new_plugin)();
            plugin.initialize(&parsed.protocol, parsed.host.as_deref(), listen, &opts)?;
            log::debug!(
                "initialized class {} (protocol {}, listen {})",
                entry.class_name,
                parsed.protocol,
                listen
            );
            return Ok(Class {
                plugin,
                entry,
                protocol: parsed.protocol,
                listen,
                progress_mode: opts.progress_mode,
                ops: OpPool::new(),
            });
        }
        Err(NaError::ProtoNoSupport)
    }

    /// Tear the class down. Outstanding addresses and ops become invalid.
    pub fn finalize(mut self) -> NaResult<()> {
        self.plugin.finalize()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn listening(&self) -> bool {
        self.listen
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.progress_mode
    }

    /// Create a completion domain.
    pub fn context(&self) -> Arc<Context> {
        Context::new()
    }

    /// Allocate a reusable operation handle.
    pub fn op_create(&self) -> OpId {
        self.ops.create()
    }

    /// Destroy an idle operation handle.
    pub fn op_destroy(&self, op: OpId) -> NaResult<()> {
        self.ops.destroy(op)
    }

    /// Largest expected-message payload.
    pub fn msg_size_max(&self) -> usize {
        self.plugin.msg_size_max()
    }

    /// Largest unexpected-message payload.
    pub fn unexpected_size_max(&self) -> usize {
        self.plugin.unexpected_size_max()
    }

    /// Resolve `name` to an address; completes through `cb`.
    pub fn addr_lookup(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        name: &str,
        cb: Callback,
    ) -> NaResult<()> {
        let parsed = addr_string::parse(name)?;
        if parsed.protocol != self.protocol {
            return Err(NaError::ProtoNoSupport);
        }
        let host = parsed
            .host
            .ok_or(NaError::InvalidArg("address string has no host"))?;

        self.bind_op(op, ctx, OpKind::Lookup, cb, None, 0, Vec::new(), 0)?;
        self.plugin
            .addr_lookup(ctx, op, &host)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    /// The local endpoint's own address; takes one reference.
    pub fn addr_self(&self) -> NaResult<Addr> {
        self.plugin.addr_self()
    }

    /// Duplicate an address, taking one more reference.
    pub fn addr_dup(&self, addr: &Addr) -> Addr {
        addr.retain();
        Arc::clone(addr)
    }

    /// Drop one address reference.
    pub fn addr_free(&self, addr: &Addr) -> NaResult<()> {
        self.plugin.addr_free(addr)
    }

    /// String form of `addr`, with the class prefix when the plugin asks
    /// for one and the class name adds information over the protocol.
    pub fn addr_to_string(&self, addr: &Addr) -> NaResult<String> {
        let body = self.plugin.addr_to_string(addr)?;
        if self.entry.prepend_class_prefix_in_addr_string && self.entry.class_name != self.protocol
        {
            Ok(format!("{}+{}", self.entry.class_name, body))
        } else {
            Ok(body)
        }
    }

    pub fn msg_send_unexpected(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        dest: &Addr,
        tag: u32,
        buf: &[u8],
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(
            op,
            ctx,
            OpKind::SendUnexpected,
            cb,
            Some(dest),
            tag,
            buf.to_vec(),
            0,
        )?;
        self.plugin
            .msg_send_unexpected(ctx, op, dest, tag)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    pub fn msg_recv_unexpected(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        max_len: usize,
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(
            op,
            ctx,
            OpKind::RecvUnexpected,
            cb,
            None,
            0,
            Vec::new(),
            max_len,
        )?;
        self.plugin
            .msg_recv_unexpected(ctx, op)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    pub fn msg_send_expected(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        dest: &Addr,
        tag: u32,
        buf: &[u8],
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(
            op,
            ctx,
            OpKind::SendExpected,
            cb,
            Some(dest),
            tag,
            buf.to_vec(),
            0,
        )?;
        self.plugin
            .msg_send_expected(ctx, op, dest, tag)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    /// Expected receives must be pre-posted; an arriving expected message
    /// with no matching post is a protocol violation.
    pub fn msg_recv_expected(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        source: &Addr,
        tag: u32,
        max_len: usize,
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(
            op,
            ctx,
            OpKind::RecvExpected,
            cb,
            Some(source),
            tag,
            Vec::new(),
            max_len,
        )?;
        self.plugin
            .msg_recv_expected(ctx, op, source, tag)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    /// One-sided write into the peer's registered memory.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        peer: &Addr,
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(op, ctx, OpKind::Put, cb, Some(peer), 0, Vec::new(), 0)?;
        let args = RmaArgs {
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            peer,
        };
        self.plugin
            .put(ctx, op, &args)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    /// One-sided read from the peer's registered memory.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        ctx: &Arc<Context>,
        op: &OpId,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        peer: &Addr,
        cb: Callback,
    ) -> NaResult<()> {
        self.bind_op(op, ctx, OpKind::Get, cb, Some(peer), 0, Vec::new(), 0)?;
        let args = RmaArgs {
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            peer,
        };
        self.plugin
            .get(ctx, op, &args)
            .map_err(|e| {
                op.abort_post();
                e
            })
    }

    /// Drive the transport for up to `timeout_ms`. At most one thread at
    /// a time runs the plugin's blocking progress per context; others
    /// wait on the gate for the remaining time.
    pub fn progress(&self, ctx: &Arc<Context>, timeout_ms: u32) -> NaResult<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        ctx.gate.enter(deadline)?;

        let remaining = if self.progress_mode.contains(ProgressMode::NO_BLOCK) {
            0
        } else {
            deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u32
        };
        let result = self.plugin.progress(remaining);
        ctx.gate.exit();
        result
    }

    /// Request cancellation of an in-flight operation. A no-op for ops
    /// that already completed.
    pub fn cancel(&self, op: &OpId) -> NaResult<()> {
        self.plugin.cancel(op)
    }

    /// True only when the completion queues are empty and the transport
    /// holds no pending inbound work.
    pub fn poll_try_wait(&self, ctx: &Context) -> bool {
        ctx.is_empty() && self.plugin.try_wait()
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_op(
        &self,
        op: &OpId,
        ctx: &Arc<Context>,
        kind: OpKind,
        cb: Callback,
        addr: Option<&Addr>,
        tag: u32,
        payload: Vec<u8>,
        max_len: usize,
    ) -> NaResult<()> {
        op.acquire_for_post()?;
        if let Some(a) = addr {
            a.retain();
        }
        let mut st = op.inner.state.lock();
        *st = OpState {
            kind,
            context: Some(Arc::clone(ctx)),
            callback: Some(cb),
            addr: addr.map(Arc::clone),
            tag,
            payload,
            max_len,
        };
        Ok(())
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pluggable network abstraction layer with a shared-memory reference
// transport. Plugins are selected by address string; a class owns the
// selected plugin, contexts own completion queues, and op ids are
// recyclable handles for in-flight operations.

mod addr_string;
mod bounded_queue;
mod context;
mod error;
mod mem_handle;
mod notifier;
mod op_id;
mod platform;
mod plugin;
mod poll_set;
mod progress;
mod shm;
mod spin_lock;

pub mod sm;

pub use addr_string::{parse as parse_addr_string, AddrInfo};
pub use context::{Callback, CallbackInfo, Completion, Context};
pub use error::{NaError, NaResult};
pub use mem_handle::{Access, MemHandle, Segment, IOV_MAX};
pub use notifier::Notifier;
pub use op_id::{OpId, OpKind};
pub use plugin::{
    Addr, Class, InitOpts, NetAddr, Plugin, PluginEntry, ProgressMode, RmaArgs, PLUGIN_TABLE,
};
pub use poll_set::{PollEvent, PollSet};
pub use shm::ShmRegion;
pub use spin_lock::{SpinLock, SpinMutex, SpinMutexGuard};

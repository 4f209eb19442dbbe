// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the network abstraction layer.
//
// Synchronous failures surface as the direct return of the call; once an
// operation has been accepted against an op id, failures surface through
// the operation's completion callback instead.

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type NaResult<T> = Result<T, NaError>;

/// Public error taxonomy.
#[derive(Debug, Error)]
pub enum NaError {
    /// Waited the full deadline without progress or an available completion.
    #[error("operation timed out")]
    Timeout,

    /// Resource temporarily unavailable (e.g. copy slot exhausted with
    /// retries disabled).
    #[error("resource temporarily unavailable")]
    Again,

    /// Caller-supplied argument was null, malformed, or out of range.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Allocation failed.
    #[error("out of memory")]
    NoMem,

    /// Output buffer too small for the incoming payload.
    #[error("buffer too small ({needed} > {capacity})")]
    Overflow { needed: usize, capacity: usize },

    /// Transferred byte count did not equal the requested length.
    #[error("short transfer ({actual} of {expected} bytes)")]
    MsgSize { expected: usize, actual: usize },

    /// No plugin matches the requested protocol or class.
    #[error("protocol not supported")]
    ProtoNoSupport,

    /// The selected plugin does not implement the requested entry point.
    #[error("operation not supported by plugin")]
    OpNotSupported,

    /// OS or transport level failure.
    #[error("transport failure")]
    Protocol(#[from] io::Error),

    /// Op id or queue not in a reusable state.
    #[error("resource busy")]
    Busy,

    /// The operation was canceled before completion.
    #[error("operation canceled")]
    Canceled,

    /// Attempt violated the access flags of a memory handle.
    #[error("permission denied by memory handle access flags")]
    Permission,

    /// Invariant violation detected at the boundary.
    #[error("internal invariant violation")]
    Fault,
}

impl NaError {
    /// Wrap the current OS error (`errno`) as a transport failure.
    pub(crate) fn last_os_error() -> NaError {
        NaError::Protocol(io::Error::last_os_error())
    }
}

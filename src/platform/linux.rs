// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Linux cross-process VM copy via process_vm_writev / process_vm_readv.
// Both iovec lists go down in a single call; the kernel handles the
// scatter/gather pairing.

use super::CopyDirection;
use crate::error::{NaError, NaResult};

pub fn vm_copy(
    pid: u32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    direction: CopyDirection,
) -> NaResult<usize> {
    let n = unsafe {
        match direction {
            CopyDirection::Write => libc::process_vm_writev(
                pid as libc::pid_t,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            ),
            CopyDirection::Read => libc::process_vm_readv(
                pid as libc::pid_t,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            ),
        }
    };
    if n == -1 {
        return Err(NaError::last_os_error());
    }
    Ok(n as usize)
}

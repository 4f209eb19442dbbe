// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Darwin cross-process VM copy via the Mach VM interface.
//
// mach_vm_write / mach_vm_read_overwrite move a single contiguous range
// per call, so scatter/gather lists are walked in lockstep, one
// overlapping chunk at a time.

use super::CopyDirection;
use crate::error::{NaError, NaResult};

type MachPort = libc::c_uint;
type KernReturn = libc::c_int;

const KERN_SUCCESS: KernReturn = 0;

extern "C" {
    fn mach_task_self() -> MachPort;
    fn task_for_pid(host: MachPort, pid: libc::c_int, task: *mut MachPort) -> KernReturn;
    fn mach_vm_write(
        task: MachPort,
        address: u64,
        data: usize,
        data_count: libc::c_uint,
    ) -> KernReturn;
    fn mach_vm_read_overwrite(
        task: MachPort,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> KernReturn;
}

fn mach_error(ret: KernReturn) -> NaError {
    NaError::Protocol(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("mach vm call failed (kern_return {ret})"),
    ))
}

fn peer_task(pid: u32) -> NaResult<MachPort> {
    let mut task: MachPort = 0;
    let ret = unsafe { task_for_pid(mach_task_self(), pid as libc::c_int, &mut task) };
    if ret != KERN_SUCCESS {
        return Err(mach_error(ret));
    }
    Ok(task)
}

pub fn vm_copy(
    pid: u32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    direction: CopyDirection,
) -> NaResult<usize> {
    let task = peer_task(pid)?;

    let mut total = 0usize;
    let (mut li, mut ri) = (0usize, 0usize);
    let (mut loff, mut roff) = (0usize, 0usize);
    while li < local.len() && ri < remote.len() {
        let lrem = local[li].iov_len - loff;
        let rrem = remote[ri].iov_len - roff;
        let chunk = lrem.min(rrem);
        let laddr = local[li].iov_base as usize + loff;
        let raddr = remote[ri].iov_base as u64 + roff as u64;

        let ret = unsafe {
            match direction {
                CopyDirection::Write => {
                    mach_vm_write(task, raddr, laddr, chunk as libc::c_uint)
                }
                CopyDirection::Read => {
                    let mut out = 0u64;
                    let r = mach_vm_read_overwrite(
                        task,
                        raddr,
                        chunk as u64,
                        laddr as u64,
                        &mut out,
                    );
                    if r == KERN_SUCCESS && out != chunk as u64 {
                        return Ok(total + out as usize);
                    }
                    r
                }
            }
        };
        if ret != KERN_SUCCESS {
            return Err(mach_error(ret));
        }

        total += chunk;
        loff += chunk;
        roff += chunk;
        if loff == local[li].iov_len {
            li += 1;
            loff = 0;
        }
        if roff == remote[ri].iov_len {
            ri += 1;
            roff = 0;
        }
    }
    Ok(total)
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named POSIX shared-memory regions.
//
// Every shared object in the transport (header rings, copy-slot arena)
// lives in its own page-aligned region. The side that creates a region
// owns it and unlinks the name when the mapping is dropped; openers only
// unmap.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{NaError, NaResult};

const PAGE_SIZE: usize = 4096;

fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn posix_name(name: &str) -> NaResult<CString> {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(full).map_err(|_| NaError::InvalidArg("shm name contains NUL"))
}

/// A named, page-aligned shared memory mapping.
pub struct ShmRegion {
    mem: *mut u8,
    len: usize,
    name: String,
    owner: bool,
}

// Safety: the region is process-shared by design; all intra-region
// synchronization is done through atomics placed inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a region exclusively. Fails if the name already exists.
    pub fn create(name: &str, len: usize) -> NaResult<ShmRegion> {
        Self::acquire(name, len, true)
    }

    /// Open an existing region. Fails if the name does not exist.
    pub fn open(name: &str, len: usize) -> NaResult<ShmRegion> {
        Self::acquire(name, len, false)
    }

    fn acquire(name: &str, len: usize, create: bool) -> NaResult<ShmRegion> {
        if len == 0 {
            return Err(NaError::InvalidArg("shm size is zero"));
        }
        let c_name = posix_name(name)?;
        let len = page_align(len);

        // Single-user transport: owner-only permissions.
        let flags = if create {
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::c_uint) };
        if fd == -1 {
            return Err(NaError::last_os_error());
        }

        if create && unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(NaError::Protocol(err));
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            if create {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(NaError::last_os_error());
        }

        Ok(ShmRegion {
            mem: mem as *mut u8,
            len,
            name: name.to_string(),
            owner: create,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size (page-aligned).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove a named region without an open handle. Errors are ignored;
    /// the name may already be gone.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = posix_name(name) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
        if self.owner {
            Self::unlink_by_name(&self.name);
        }
    }
}

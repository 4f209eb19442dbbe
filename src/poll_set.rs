// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// OS-level readiness multiplexer with per-fd callback dispatch.
//
// epoll on Linux, kqueue on the BSDs and Darwin. Every registration is
// level-triggered read readiness; the handler is told whether the fd is
// in an error/hangup state and reports whether it performed useful work.
// `wait` returns true iff any handler did.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::error::{NaError, NaResult};

const MAX_EVENTS: usize = 32;

/// A registered readiness handler.
///
/// `on_ready(error)` is invoked outside all poll-set locks, so handlers
/// may add or remove registrations. Returns whether progress was made.
pub trait PollEvent: Send + Sync {
    fn on_ready(&self, error: bool) -> NaResult<bool>;
}

pub struct PollSet {
    sel: OwnedFd,
    handlers: Mutex<HashMap<RawFd, Arc<dyn PollEvent>>>,
}

impl PollSet {
    pub fn new() -> NaResult<PollSet> {
        let sel = Self::new_selector()?;
        Ok(PollSet {
            sel,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(target_os = "linux")]
    fn new_selector() -> NaResult<OwnedFd> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(target_os = "linux"))]
    fn new_selector() -> NaResult<OwnedFd> {
        let fd = unsafe { libc::kqueue() };
        if fd == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Register `fd` for read readiness, dispatching to `handler`.
    pub fn add(&self, fd: RawFd, handler: Arc<dyn PollEvent>) -> NaResult<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&fd) {
            return Err(NaError::InvalidArg("fd already registered"));
        }
        self.sys_add(fd)?;
        handlers.insert(fd, handler);
        Ok(())
    }

    /// Drop the registration for `fd`. Unknown fds are ignored.
    pub fn remove(&self, fd: RawFd) -> NaResult<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.remove(&fd).is_none() {
            return Ok(());
        }
        self.sys_remove(fd)
    }

    #[cfg(target_os = "linux")]
    fn sys_add(&self, fd: RawFd) -> NaResult<()> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            u64: fd as u64,
        };
        let res = unsafe {
            libc::epoll_ctl(self.sel.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if res == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn sys_remove(&self, fd: RawFd) -> NaResult<()> {
        let res = unsafe {
            libc::epoll_ctl(
                self.sel.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if res == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn sys_add(&self, fd: RawFd) -> NaResult<()> {
        let changes = [libc::kevent {
            ident: fd as usize,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        let res = unsafe {
            libc::kevent(
                self.sel.as_raw_fd(),
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if res == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn sys_remove(&self, fd: RawFd) -> NaResult<()> {
        let changes = [libc::kevent {
            ident: fd as usize,
            filter: libc::EVFILT_READ,
            flags: libc::EV_DELETE,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        let res = unsafe {
            libc::kevent(
                self.sel.as_raw_fd(),
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if res == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (0 = poll once) and dispatch ready fds.
    /// Returns true iff at least one handler reported progress.
    pub fn wait(&self, timeout_ms: u32) -> NaResult<bool> {
        let ready = self.sys_wait(timeout_ms)?;

        let mut progressed = false;
        for (fd, error) in ready {
            // Look the handler up per event: an earlier callback may have
            // removed (or replaced) later registrations.
            let handler = {
                let handlers = self.handlers.lock().unwrap();
                handlers.get(&fd).cloned()
            };
            if let Some(h) = handler {
                progressed |= h.on_ready(error)?;
            }
        }
        Ok(progressed)
    }

    #[cfg(target_os = "linux")]
    fn sys_wait(&self, timeout_ms: u32) -> NaResult<Vec<(RawFd, bool)>> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let timeout = timeout_ms.min(i32::MAX as u32) as libc::c_int;
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.sel.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(NaError::Protocol(err));
            }
        };
        Ok(events[..n]
            .iter()
            .map(|ev| {
                let error = ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                (ev.u64 as RawFd, error)
            })
            .collect())
    }

    #[cfg(not(target_os = "linux"))]
    fn sys_wait(&self, timeout_ms: u32) -> NaResult<Vec<(RawFd, bool)>> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = loop {
            let n = unsafe {
                libc::kevent(
                    self.sel.as_raw_fd(),
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    &ts,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(NaError::Protocol(err));
            }
        };
        Ok(events[..n]
            .iter()
            .map(|ev| {
                let error = ev.flags & (libc::EV_ERROR | libc::EV_EOF) != 0;
                (ev.ident as RawFd, error)
            })
            .collect())
    }

    /// The selector fd itself, so the poll set can be nested in an outer
    /// event loop.
    pub fn raw_fd(&self) -> RawFd {
        self.sel.as_raw_fd()
    }
}

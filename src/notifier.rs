// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Edge-triggered inter-process wakeup.
//
// Backed by eventfd on Linux, by a named FIFO elsewhere. Either way the
// notifier is a single non-blocking fd: `set` writes an 8-byte counter
// increment, `get` drains it. A single `set` suffices to wake any number
// of queued `get` calls that follow; the exact wake count is irrelevant.
// The fd can be handed to a peer process over a UNIX socket.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{NaError, NaResult};

pub struct Notifier {
    fd: OwnedFd,
    // Owned FIFO path, unlinked on destroy. Always None for eventfd and
    // for notifiers received from a peer.
    fifo_path: Option<PathBuf>,
}

impl Notifier {
    /// Create a fresh notifier. `dir`/`name` locate the FIFO on platforms
    /// without eventfd; the eventfd backend ignores them.
    #[cfg(target_os = "linux")]
    pub fn new(_dir: &Path, _name: &str) -> NaResult<Notifier> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd == -1 {
            return Err(NaError::last_os_error());
        }
        Ok(Notifier {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            fifo_path: None,
        })
    }

    /// Create a fresh notifier backed by a named FIFO under `dir`.
    #[cfg(not(target_os = "linux"))]
    pub fn new(dir: &Path, name: &str) -> NaResult<Notifier> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = dir.join(name);
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| NaError::InvalidArg("fifo path contains NUL"))?;
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } == -1 {
            return Err(NaError::last_os_error());
        }
        // O_RDWR keeps both ends open in one fd so the peer sees neither
        // EOF nor ENXIO regardless of open order.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::unlink(c_path.as_ptr()) };
            return Err(NaError::Protocol(err));
        }
        Ok(Notifier {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            fifo_path: Some(path),
        })
    }

    /// Wrap a notifier fd received from a peer process.
    pub fn from_fd(fd: OwnedFd) -> Notifier {
        Notifier {
            fd,
            fifo_path: None,
        }
    }

    /// Signal the notifier.
    pub fn set(&self) -> NaResult<()> {
        let buf = 1u64.to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                // Counter saturated: drain and signal again.
                io::ErrorKind::WouldBlock => {
                    self.get()?;
                }
                io::ErrorKind::Interrupted => {}
                _ => return Err(NaError::Protocol(err)),
            }
        }
    }

    /// Drain the notifier completely. Returns whether it had been signaled.
    pub fn get(&self) -> NaResult<bool> {
        let mut signaled = false;
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                // The FIFO backend may hold several pending increments;
                // keep reading until empty (eventfd drains in one read).
                signaled = true;
                continue;
            }
            if n == 0 {
                return Ok(signaled);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(signaled),
                io::ErrorKind::Interrupted => {}
                _ => return Err(NaError::Protocol(err)),
            }
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Some(path) = &self.fifo_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let dir = std::env::temp_dir();
        let name = format!("nal-notif-test-{}", std::process::id());
        let n = Notifier::new(&dir, &name).unwrap();
        assert!(!n.get().unwrap());
        n.set().unwrap();
        assert!(n.get().unwrap());
        assert!(!n.get().unwrap());
    }

    #[test]
    fn multiple_sets_single_get() {
        let dir = std::env::temp_dir();
        let name = format!("nal-notif-test2-{}", std::process::id());
        let n = Notifier::new(&dir, &name).unwrap();
        for _ in 0..5 {
            n.set().unwrap();
        }
        assert!(n.get().unwrap());
        assert!(!n.get().unwrap());
    }
}

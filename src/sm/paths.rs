// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Filesystem and shared-memory naming for the SM transport.
//
// Sockets and FIFOs:  <tmpdir>/<prefix>_<user>/<pid>/<id>/sock
//                     <tmpdir>/<prefix>_<user>/<pid>/<id>/fifo-<conn>-{s,r}
// SHM objects:        <prefix>_<user>-<pid>-<id>            (copy arena)
//                     <prefix>_<user>-<pid>-<id>-<conn>-{s,r} (ring pair)
//
// Everything is owner-only; the cleanup walk skips entries not owned by
// the current user.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

pub const SM_PREFIX: &str = "nal_sm";

/// Minimum time between two accepts on one listener.
pub const ACCEPT_INTERVAL_MS: u64 = 100;

fn username() -> String {
    match std::env::var("USER") {
        Ok(u) if !u.is_empty() => u,
        _ => format!("uid{}", unsafe { libc::getuid() }),
    }
}

fn tmpdir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// `<tmpdir>/<prefix>_<user>` — root of all per-instance directories.
pub fn tmp_root() -> PathBuf {
    tmpdir().join(format!("{}_{}", SM_PREFIX, username()))
}

/// Per-instance directory holding the socket and any FIFOs.
pub fn instance_dir(pid: u32, id: u8) -> PathBuf {
    tmp_root().join(pid.to_string()).join(id.to_string())
}

/// Listening UNIX-socket path of an instance.
pub fn sock_path(pid: u32, id: u8) -> PathBuf {
    instance_dir(pid, id).join("sock")
}

/// FIFO file name for one notifier of a connection.
pub fn fifo_name(conn_id: u32, side: char) -> String {
    format!("fifo-{conn_id}-{side}")
}

/// SHM name of an instance's copy-slot arena.
pub fn copy_buf_name(pid: u32, id: u8) -> String {
    format!("{}_{}-{}-{}", SM_PREFIX, username(), pid, id)
}

/// SHM name of one ring of a connection's pair. `side` is `'s'` or `'r'`
/// from the listening side's viewpoint; the connecting side swaps them so
/// each side's send ring is the other's recv ring.
pub fn ring_name(pid: u32, id: u8, conn_id: u32, side: char) -> String {
    format!("{}-{}-{}", copy_buf_name(pid, id), conn_id, side)
}

/// Remove leftovers of crashed instances: every entry under the tmp root
/// and every SHM object carrying our prefix, provided the current user
/// owns it. Live instances of other processes are removed too, so this
/// belongs in tests and administrative tools only.
pub fn cleanup() {
    let root = tmp_root();
    let uid = unsafe { libc::geteuid() };
    if let Ok(entries) = fs::read_dir(&root) {
        for entry in entries.flatten() {
            let owned = entry
                .metadata()
                .map(|m| m.uid() == uid)
                .unwrap_or(false);
            if owned {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
    let _ = fs::remove_dir(&root);

    // POSIX has no portable way to enumerate SHM objects; on Linux they
    // are visible as files under /dev/shm.
    #[cfg(target_os = "linux")]
    {
        let prefix = format!("{}_{}-", SM_PREFIX, username());
        if let Ok(entries) = fs::read_dir("/dev/shm") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let owned = entry
                    .metadata()
                    .map(|m| m.uid() == uid)
                    .unwrap_or(false);
                if owned && name.to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection-establishment wire helpers over the UNIX socket.
//
// Two messages only:
//   ADDR_INFO (client→server): (pid u32, id u8) as two iovecs.
//   CONN_ID   (server→client): (conn_id u32) plus exactly two notifier
//     fds as SCM_RIGHTS ancillary data, ordered [local, remote] from the
//     sender's viewpoint; the receiver inverts them.
//
// Both messages are small enough to never split across datagram-style
// stream writes in practice; a short read is a protocol error.

use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::{NaError, NaResult};

pub(crate) const MAX_CONN_FDS: usize = 2;

/// Send the client's identity.
pub(crate) fn send_addr_info(sock: &UnixStream, pid: u32, id: u8) -> NaResult<()> {
    let pid_bytes = pid.to_ne_bytes();
    let id_bytes = [id];
    let iovs = [IoSlice::new(&pid_bytes), IoSlice::new(&id_bytes)];
    let n = (&*sock).write_vectored(&iovs).map_err(NaError::Protocol)?;
    if n != 5 {
        return Err(NaError::MsgSize {
            expected: 5,
            actual: n,
        });
    }
    Ok(())
}

/// Receive the client's identity (server side, ADDR_INFO phase).
pub(crate) fn recv_addr_info(sock: &UnixStream) -> NaResult<(u32, u8)> {
    let mut buf = [0u8; 5];
    let n = (&*sock).read(&mut buf).map_err(NaError::Protocol)?;
    if n != buf.len() {
        return Err(NaError::MsgSize {
            expected: buf.len(),
            actual: n,
        });
    }
    let pid = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((pid, buf[4]))
}

/// Send the connection id and the two notifier fds.
pub(crate) fn send_conn_id(sock: &UnixStream, conn_id: u32, fds: [RawFd; 2]) -> NaResult<()> {
    use std::os::fd::AsRawFd;

    let payload = conn_id.to_ne_bytes();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fd_bytes = mem::size_of::<RawFd>() * fds.len();
    let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = [0u8; 64];
    assert!(space <= cmsg_buf.len());

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
    }

    let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if n == -1 {
        return Err(NaError::last_os_error());
    }
    if n as usize != payload.len() {
        return Err(NaError::MsgSize {
            expected: payload.len(),
            actual: n as usize,
        });
    }
    Ok(())
}

/// Receive the connection id and the notifier fds (client side, CONN_ID
/// phase). Returns `(conn_id, fds)` in the sender's order.
pub(crate) fn recv_conn_id(sock: &UnixStream) -> NaResult<(u32, Vec<OwnedFd>)> {
    use std::os::fd::AsRawFd;

    let mut payload = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fd_bytes = mem::size_of::<RawFd>() * MAX_CONN_FDS;
    let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = [0u8; 64];
    assert!(space <= cmsg_buf.len());

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n == -1 {
        return Err(NaError::last_os_error());
    }
    if n as usize != payload.len() {
        return Err(NaError::MsgSize {
            expected: payload.len(),
            actual: n as usize,
        });
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if fds.len() != MAX_CONN_FDS {
        return Err(NaError::Protocol(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} fds, got {}", MAX_CONN_FDS, fds.len()),
        )));
    }

    Ok((u32::from_ne_bytes(payload), fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn addr_info_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        send_addr_info(&a, 0xDEAD_0042, 7).unwrap();
        let (pid, id) = recv_addr_info(&b).unwrap();
        assert_eq!(pid, 0xDEAD_0042);
        assert_eq!(id, 7);
    }

    #[test]
    fn conn_id_carries_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let (x, y) = UnixStream::pair().unwrap();
        send_conn_id(&a, 3, [x.as_raw_fd(), y.as_raw_fd()]).unwrap();
        let (conn_id, fds) = recv_conn_id(&b).unwrap();
        assert_eq!(conn_id, 3);
        assert_eq!(fds.len(), 2);
        // The received fds are fresh descriptors for the same objects.
        assert_ne!(fds[0].as_raw_fd(), x.as_raw_fd());

        // Prove fds[0] still works: write through x's peer and read it.
        (&y).write_all(b"z").unwrap();
        let mut stream = UnixStream::from(fds[0].try_clone().unwrap());
        stream.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"z");
    }
}

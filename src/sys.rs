//! Thin libc wrappers: ancillary data on Unix sockets, `poll`, daemonizing.
//!
//! Everything here is a direct syscall shim returning `std::io::Result`;
//! state lives in the callers.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum number of descriptors a control connection may hold.
pub const MAX_PASSED_FDS: usize = 2;

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer process id.
    pub pid: i32,
    /// Peer user id.
    pub uid: u32,
    /// Peer group id.
    pub gid: u32,
}

impl From<libc::ucred> for PeerCredentials {
    fn from(c: libc::ucred) -> Self {
        Self {
            pid: c.pid,
            uid: c.uid,
            gid: c.gid,
        }
    }
}

/// Result of one `recvmsg` call.
#[derive(Debug, Default)]
pub struct Received {
    /// Bytes placed in the data buffer (0 = EOF).
    pub len: usize,
    /// `SCM_CREDENTIALS`, when the kernel attached them.
    pub credentials: Option<PeerCredentials>,
    /// Descriptors from `SCM_RIGHTS`, owned by the caller.
    pub fds: Vec<OwnedFd>,
    /// The control buffer was too small (`MSG_CTRUNC`).
    pub truncated: bool,
}

/// Backing store for control messages; `u64` keeps `cmsghdr` aligned.
type CmsgBuf = [u64; 16];

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Ask the kernel to attach `SCM_CREDENTIALS` to every message received on `fd`.
pub fn enable_passcred(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: `one` outlives the call and the length matches its type.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&raw const one).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Credentials recorded by the kernel at `connect()` time (`SO_PEERCRED`).
pub fn peer_credentials(fd: RawFd) -> io::Result<PeerCredentials> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut cred).cast(),
            &raw mut len,
        )
    })?;
    Ok(cred.into())
}

/// Receive into `buf` with `recvmsg`, collecting credentials and descriptors.
///
/// Received descriptors are opened with `MSG_CMSG_CLOEXEC`.
pub fn recv_with_ancillary(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    let mut cmsg_buf: CmsgBuf = [0; 16];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: msghdr is plain data; every pointer field is set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = size_of::<CmsgBuf>() as _;

    // SAFETY: `msg` points at `iov` and `cmsg_buf`, both alive for the call.
    let n = unsafe { libc::recvmsg(fd, &raw mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut out = Received {
        len: n as usize,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        ..Received::default()
    };

    // SAFETY: the CMSG_* macros walk the control buffer the kernel just
    // filled; payload reads use read_unaligned and stay within cmsg_len.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            let data = libc::CMSG_DATA(cmsg);
            let payload_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            if level == libc::SOL_SOCKET && kind == libc::SCM_CREDENTIALS {
                if payload_len >= size_of::<libc::ucred>() {
                    let cred: libc::ucred = std::ptr::read_unaligned(data.cast());
                    out.credentials = Some(cred.into());
                }
            } else if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                let count = payload_len / size_of::<libc::c_int>();
                for i in 0..count {
                    let raw: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * size_of::<libc::c_int>()).cast(),
                    );
                    out.fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }

    Ok(out)
}

/// Send `data` with `fds` attached as `SCM_RIGHTS`.
///
/// The client side of descriptor passing; the server only receives.
pub fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.len() > 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many descriptors for one message",
        ));
    }
    let mut cmsg_buf: CmsgBuf = [0; 16];
    let fd_bytes = size_of_val(fds);
    let mut iov = libc::iovec {
        iov_base: data.as_ptr().cast_mut().cast(),
        iov_len: data.len(),
    };
    // SAFETY: msghdr is plain data; every pointer field is set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        // SAFETY: CMSG_SPACE is a pure size computation.
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as _;
        // SAFETY: the control buffer holds CMSG_SPACE(8 fds) < 128 bytes.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            let dst = libc::CMSG_DATA(cmsg);
            for (i, raw) in fds.iter().enumerate() {
                std::ptr::write_unaligned(dst.add(i * size_of::<libc::c_int>()).cast(), *raw);
            }
        }
    }

    // SAFETY: `msg` points at live `iov` and `cmsg_buf`.
    let n = unsafe { libc::sendmsg(fd, &raw const msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Wait on `fds`; `None` blocks indefinitely.
pub fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
    };
    // SAFETY: the slice is valid for `fds.len()` pollfd entries.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    Ok(cvt(n)? as usize)
}

/// Detach from the controlling terminal (`daemon(3)`). The working
/// directory is kept so relative socket and pid paths stay valid.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called before any threads are spawned.
    cvt(unsafe { libc::daemon(1, 0) })?;
    Ok(())
}

/// Wall-clock time in microseconds since the epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn peer_credentials_of_socketpair_are_ours() {
        let (a, _b) = UnixStream::pair().unwrap();
        let cred = peer_credentials(a.as_raw_fd()).unwrap();
        assert_eq!(cred.pid, std::process::id() as i32);
        // SAFETY: getuid has no preconditions.
        assert_eq!(cred.uid, unsafe { libc::getuid() });
    }

    #[test]
    fn passcred_attaches_credentials() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        enable_passcred(rx.as_raw_fd()).unwrap();
        tx.write_all(&[0; 4]).unwrap();

        let mut buf = [0u8; 4];
        let got = recv_with_ancillary(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(got.len, 4);
        let cred = got.credentials.expect("kernel should attach SCM_CREDENTIALS");
        assert_eq!(cred.pid, std::process::id() as i32);
    }

    #[test]
    fn descriptors_round_trip_through_socket() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (mut pipe_w, pipe_r) = UnixStream::pair().unwrap();

        let n = send_with_fds(tx.as_raw_fd(), &[0; 4], &[pipe_r.as_fd().as_raw_fd()]).unwrap();
        assert_eq!(n, 4);
        drop(pipe_r);

        let mut buf = [0u8; 4];
        let got = recv_with_ancillary(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(got.fds.len(), 1);

        pipe_w.write_all(b"through").unwrap();
        let mut received = UnixStream::from(got.fds.into_iter().next().unwrap());
        let mut out = [0u8; 7];
        received.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"through");
    }

    #[test]
    fn poll_times_out_on_idle_socket() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut fds = [libc::pollfd {
            fd: a.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let n = poll(&mut fds, Some(Duration::from_millis(5))).unwrap();
        assert_eq!(n, 0);
    }
}

//! Thin wrappers over the raw syscalls a non-blocking socket needs.
//!
//! Kept separate from [`crate::connection`] so the locking/buffering
//! logic there never has to look at `libc` directly.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

/// Flip `fd` into non-blocking mode via `fcntl(F_SETFL, O_NONBLOCK)`.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A single non-blocking `read(2)` into `buf`. Mirrors `io::Read` but
/// avoids pulling a `File`/`TcpStream` wrapper in just to make one raw
/// syscall on a fd we already own as a bare integer.
pub(crate) fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// A single non-blocking `write(2)` of `buf`.
pub(crate) fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Outcome of [`poll_fd`], distinguishing "timed out" from "woken by a
/// signal" from "something is ready" — `conn_wait`'s three-way return
/// and `flush`'s EINTR-vs-drained distinction both read off this.
pub(crate) enum PollWait {
    Ready(crate::multiplexer::Readiness),
    TimedOut,
    Interrupted,
}

/// A single blocking (or timed) `poll(2)` call on one fd. `timeout_ms`
/// follows `poll(2)`'s own convention: negative means "block
/// indefinitely."
pub(crate) fn poll_fd(
    fd: RawFd,
    interest: crate::multiplexer::Readiness,
    timeout_ms: i32,
) -> io::Result<PollWait> {
    let mut events: libc::c_short = 0;
    if interest.readable {
        events |= libc::POLLIN;
    }
    if interest.writable {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd { fd, events, revents: 0 };

    let ret = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(PollWait::Interrupted);
        }
        return Err(err);
    }
    if ret == 0 {
        return Ok(PollWait::TimedOut);
    }
    Ok(PollWait::Ready(crate::multiplexer::Readiness {
        readable: pfd.revents & libc::POLLIN != 0,
        writable: pfd.revents & libc::POLLOUT != 0,
    }))
}

/// Blocking `connect(2)` with an overall deadline. `std::net::TcpStream`
/// already has a `connect_timeout`, so this is a direct pass-through —
/// kept here so the call site reads as "the gateway's connect", not a
/// stray `std::net` import in `connection.rs`. Used only by
/// [`crate::connection::Connection::connect_tcp_blocking`], kept around
/// for callers that genuinely want a thread blocked for the duration of
/// the handshake.
pub(crate) fn connect_tcp_blocking(addr: SocketAddr, timeout: Duration) -> io::Result<RawFd> {
    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    Ok(stream.into_raw_fd())
}

/// Non-blocking `connect(2)`: flip the socket non-blocking before
/// issuing the connect, then wait for writability (bounded by
/// `timeout`) and check `SO_ERROR` to learn whether it actually
/// succeeded. This is the default path
/// [`crate::connection::Connection::connect_tcp`] uses — unlike
/// [`connect_tcp_blocking`], the calling thread is only ever blocked
/// inside a single bounded `poll(2)`, not for the whole handshake.
pub(crate) fn connect_tcp_nonblocking(addr: SocketAddr, timeout: Duration) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fd` was just created above and is owned by this function
    // until it's handed back via `into_raw_fd` or dropped on an error path.
    let socket = unsafe { std::net::TcpStream::from_raw_fd(fd) };

    if let Err(err) = set_nonblocking(fd) {
        return Err(err);
    }

    let (sockaddr, len) = socketaddr_to_raw(addr);
    let ret = unsafe { libc::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok(socket.into_raw_fd());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        match poll_fd(fd, crate::multiplexer::Readiness::writable(), timeout_ms)? {
            PollWait::TimedOut => return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            PollWait::Interrupted => continue,
            PollWait::Ready(_) => break,
        }
    }

    match socket_error(fd)? {
        0 => Ok(socket.into_raw_fd()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

fn socketaddr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

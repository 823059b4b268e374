//! Raw IPv4/Unix socket helpers over libc.
//!
//! Thin `io::Result` wrappers around the syscalls the stream and listener
//! need: socket setup, non-blocking accept/connect, `SO_ERROR` harvesting,
//! vectored sends, and a socketpair for tests and local plumbing. `EINTR`
//! is retried here so callers only ever see would-block or real failures.
//!
//! Writes go through `send`/`sendmsg` so `SIGPIPE` can be suppressed
//! (`MSG_NOSIGNAL` on Linux, `SO_NOSIGPIPE` at socket setup elsewhere); a
//! peer-closed socket must surface as `EPIPE` on the write path, not kill
//! the process.

use smallvec::SmallVec;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

/// Most extents submitted to one vectored send.
pub(crate) const MAX_IOVECS: usize = 64;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Per-socket setup applied to every descriptor this module creates.
fn init_socket(fd: RawFd) -> io::Result<()> {
    set_cloexec(fd)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let one: libc::c_int = 1;
        // Safety: `one` is valid for the option length passed.
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&one as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
    }
    Ok(())
}

/// Creates a TCP socket.
pub fn socket_v4() -> io::Result<RawFd> {
    // Safety: plain syscall, no pointers.
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
    if let Err(err) = init_socket(fd) {
        close(fd);
        return Err(err);
    }
    Ok(fd)
}

/// Creates a connected stream socketpair.
pub fn socketpair_stream() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: fds is valid for two descriptors.
    cvt(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) })?;
    for fd in fds {
        if let Err(err) = init_socket(fd) {
            close(fds[0]);
            close(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Puts a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on a caller-owned descriptor.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Sets close-on-exec.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on a caller-owned descriptor.
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Enables local address reuse on a listening socket.
pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // Safety: `one` is valid for the option length passed.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&one as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn sockaddr_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    // Safety: an all-zero sockaddr_in is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    addr
}

/// Binds to an IPv4 address and port; port 0 selects an ephemeral port.
pub fn bind_v4(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_v4(ip, port);
    // Safety: addr outlives the call and the length matches its type.
    cvt(unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Reads back the locally bound port.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    // Safety: an all-zero sockaddr_in is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // Safety: addr/len are valid for getsockname to fill.
    cvt(unsafe {
        libc::getsockname(
            fd,
            (&mut addr as *mut libc::sockaddr_in).cast::<libc::sockaddr>(),
            &mut len,
        )
    })?;
    Ok(u16::from_be(addr.sin_port))
}

/// Starts listening with the given backlog.
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    // Safety: plain syscall, no pointers.
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accepts one pending connection, returning the raw descriptor.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: storage/len are valid for accept to fill.
        let rc = unsafe {
            libc::accept(
                fd,
                (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        };
        if rc >= 0 {
            if let Err(err) = init_socket(rc) {
                close(rc);
                return Err(err);
            }
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Starts a connect to `ip:port`. A non-blocking socket reports
/// `EINPROGRESS` here and the outcome via `SO_ERROR` later.
pub fn connect_v4(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_v4(ip, port);
    // Safety: addr outlives the call and the length matches its type.
    cvt(unsafe {
        libc::connect(
            fd,
            (&addr as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Harvests and clears the socket's pending error.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: err/len are valid for getsockopt to fill.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Reads into `buf`, retrying `EINTR`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // Safety: buf is valid for its length.
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends from `buf` on a socket, retrying `EINTR`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        // Safety: buf is valid for its length.
        let rc = unsafe {
            libc::send(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len(), SEND_FLAGS)
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends multiple extents in one syscall, retrying `EINTR`. Extents past
/// [`MAX_IOVECS`] are left for the next readiness edge.
pub(crate) fn write_vectored(fd: RawFd, extents: &[&[u8]]) -> io::Result<usize> {
    let mut iov: SmallVec<[libc::iovec; 8]> = SmallVec::new();
    for extent in extents.iter().take(MAX_IOVECS) {
        iov.push(libc::iovec {
            iov_base: extent.as_ptr() as *mut libc::c_void,
            iov_len: extent.len(),
        });
    }
    // Safety: an all-zero msghdr is a valid value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    loop {
        // Safety: msg and the iovecs it points at outlive the call.
        let rc = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Closes a descriptor, ignoring errors.
pub fn close(fd: RawFd) {
    // Safety: the caller owns the descriptor and closes it exactly once.
    unsafe {
        libc::close(fd);
    }
}

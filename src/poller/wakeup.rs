//! Cross-thread wakeup descriptor.
//!
//! An eventfd on Linux, a non-blocking pipe on other Unix platforms. A
//! producer thread calls [`Wakeup::notify`] to interrupt a blocked poll;
//! the loop registers [`Wakeup::read_fd`] as an internal handler and calls
//! [`Wakeup::drain`] when it fires. Draining discards every pending
//! payload — the injection queue, not the wakeup byte count, is the source
//! of truth for how much work arrived.

use std::io;
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    #[cfg(target_os = "linux")]
    EventFd,
    #[cfg(not(target_os = "linux"))]
    Pipe,
}

/// The wakeup descriptor pair. On eventfd platforms both ends are the same
/// descriptor.
#[derive(Debug)]
pub(crate) struct Wakeup {
    kind: Kind,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Wakeup {
    #[cfg(target_os = "linux")]
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kind: Kind::EventFd,
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds is valid for two descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // Safety: fd was just created and is owned by us.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            kind: Kind::Pipe,
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Descriptor the loop watches for readability.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Interrupts a blocked poll. Callable from any thread; a full
    /// pipe/counter already guarantees the consumer will wake, so
    /// would-block is not an error.
    pub(crate) fn notify(&self) {
        match self.kind {
            #[cfg(target_os = "linux")]
            Kind::EventFd => self.send(&1u64.to_ne_bytes()),
            #[cfg(not(target_os = "linux"))]
            Kind::Pipe => self.send(&[1u8]),
        }
    }

    fn send(&self, payload: &[u8]) {
        loop {
            // Safety: payload is a valid buffer for its length.
            let rc = unsafe {
                libc::write(
                    self.write_fd,
                    payload.as_ptr().cast::<libc::c_void>(),
                    payload.len(),
                )
            };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
    }

    /// Discards every pending payload. Loop thread only.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: buf is a valid buffer for its length.
            let rc = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
            };
            if rc > 0 {
                match self.kind {
                    #[cfg(target_os = "linux")]
                    // An eventfd read returns the whole counter at once.
                    Kind::EventFd => return,
                    #[cfg(not(target_os = "linux"))]
                    Kind::Pipe => continue,
                }
            }
            if rc == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        // Safety: the descriptors are owned by this pair and closed once.
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

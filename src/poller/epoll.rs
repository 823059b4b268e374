//! Linux epoll backend.
//!
//! Level-triggered; the registration token rides in the kernel event's
//! `u64` slot, so no lookup table is needed on the poll path.

use super::{PollEvent, EVENTS_CAPACITY};
use crate::interest::Interest;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn update(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Interest::NONE)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut flags = 0u32;
        if interest.is_readable() {
            flags |= libc::EPOLLIN as u32;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }
        // A non-null event pointer is required even for EPOLL_CTL_DEL.
        let mut event = libc::epoll_event {
            events: flags,
            u64: token,
        };
        // Safety: `event` outlives the call; fd validity is the caller's
        // registration invariant.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Runs one poll pass, appending readiness events to `out`.
    ///
    /// `None` blocks until an event arrives; `EINTR` is reported as an
    /// empty pass.
    pub(crate) fn poll(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        // Safety: epoll_event is plain old data; zeroed is a valid value.
        let mut buf: [libc::epoll_event; EVENTS_CAPACITY] = unsafe { std::mem::zeroed() };
        let timeout_ms = timeout.map_or(-1, timeout_to_ms);
        // Safety: buf is valid for EVENTS_CAPACITY entries.
        let count = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                EVENTS_CAPACITY as libc::c_int,
                timeout_ms,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in &buf[..count as usize] {
            let flags = event.events as libc::c_int;
            let mut readiness = Interest::NONE;
            if flags & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                readiness = readiness.add(Interest::READABLE);
            }
            if flags & (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                readiness = readiness.add(Interest::WRITABLE);
            }
            out.push(PollEvent {
                token: event.u64,
                readiness,
            });
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: epfd is owned by this poller and closed exactly once.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Rounds up to whole milliseconds so a timer is never polled-for early.
fn timeout_to_ms(timeout: Duration) -> libc::c_int {
    let mut ms = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

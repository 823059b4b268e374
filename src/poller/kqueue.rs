//! macOS/BSD kqueue backend.
//!
//! Read and write interest map to separate `EVFILT_READ`/`EVFILT_WRITE`
//! registrations; omitting `EV_CLEAR` keeps the filters level-triggered to
//! match the epoll backend. The registration token rides in `udata`.

use super::{PollEvent, EVENTS_CAPACITY};
use crate::interest::Interest;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

pub(crate) struct Poller {
    kq: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: kq is a fresh descriptor owned by us.
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self { kq })
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.apply(fd, libc::EVFILT_READ, interest.is_readable(), token)?;
        self.apply(fd, libc::EVFILT_WRITE, interest.is_writable(), token)
    }

    pub(crate) fn update(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.register(fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.apply(fd, libc::EVFILT_READ, false, 0)?;
        self.apply(fd, libc::EVFILT_WRITE, false, 0)
    }

    /// Adds or deletes a single filter. Deleting a filter that was never
    /// added is not an error.
    fn apply(&self, fd: RawFd, filter: i16, enable: bool, token: u64) -> io::Result<()> {
        let flags = if enable {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token as usize as *mut libc::c_void,
        };
        // Safety: change is valid for one entry; no output buffer.
        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if !enable && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Runs one poll pass, appending readiness events to `out`.
    pub(crate) fn poll(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        // Safety: kevent is plain old data; zeroed is a valid value.
        let mut buf: [libc::kevent; EVENTS_CAPACITY] = unsafe { std::mem::zeroed() };
        let timespec = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(t.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);
        // Safety: buf is valid for EVENTS_CAPACITY entries.
        let count = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                EVENTS_CAPACITY as libc::c_int,
                timespec_ptr,
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
            let mut readiness = Interest::NONE;
            if event.filter == libc::EVFILT_READ {
                readiness = readiness.add(Interest::READABLE);
            }
            if event.filter == libc::EVFILT_WRITE {
                readiness = readiness.add(Interest::WRITABLE);
            }
            if event.flags & libc::EV_ERROR != 0 {
                readiness = Interest::BOTH;
            }
            out.push(PollEvent {
                token: event.udata as usize as u64,
                readiness,
            });
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: kq is owned by this poller and closed exactly once.
        unsafe {
            libc::close(self.kq);
        }
    }
}

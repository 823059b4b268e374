//! Readiness pollers.
//!
//! One backend per platform — epoll on Linux, kqueue on macOS and the
//! BSDs — behind a common level-triggered interface: register a descriptor
//! with a 64-bit token and an [`Interest`], collect `(token, readiness)`
//! pairs per poll pass. Error and hangup conditions are folded into both
//! readiness bits so a handler watching either direction observes the
//! failure through its next syscall.

use crate::interest::Interest;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
mod wakeup;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use kqueue::Poller;
pub(crate) use wakeup::Wakeup;

/// Maximum events collected in one poll pass.
pub(crate) const EVENTS_CAPACITY: usize = 64;

/// A readiness event reported by the poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    /// The token supplied at registration.
    pub(crate) token: u64,
    /// The readiness observed, error/hangup folded in.
    pub(crate) readiness: Interest,
}

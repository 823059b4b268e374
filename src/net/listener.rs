//! Non-blocking TCP connection listener.
//!
//! Accepted connections are handed to the user callback as raw descriptors
//! (already non-blocking). That keeps the listener loop-agnostic: a
//! multi-core deployment runs one loop per core and wraps each accepted
//! descriptor as a [`Stream`](crate::net::Stream) on whichever loop should
//! own it.

use crate::error::Error;
use crate::event_loop::{EventHandler, EventLoop, Token};
use crate::interest::Interest;
use crate::net::socket;
use std::cell::Cell;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

/// A listening TCP socket driving an accept callback.
///
/// Lifecycle: [`bind`](Self::bind) (or [`bind_addr`](Self::bind_addr)),
/// [`listen`](Self::listen), then [`start_accepting`](Self::start_accepting).
/// All methods must be called on the listener's loop thread.
pub struct ConnectionListener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    event_loop: Rc<EventLoop>,
    fd: Cell<RawFd>,
    token: Cell<Option<Token>>,
    port: Cell<u16>,
    accept_callback: Box<dyn Fn(RawFd)>,
    error_callback: Box<dyn Fn(&Error)>,
}

impl ConnectionListener {
    /// Creates an unbound listener with its accept and error callbacks.
    #[must_use]
    pub fn new(
        event_loop: &Rc<EventLoop>,
        accept_callback: impl Fn(RawFd) + 'static,
        error_callback: impl Fn(&Error) + 'static,
    ) -> ConnectionListener {
        ConnectionListener {
            inner: Rc::new(ListenerInner {
                event_loop: Rc::clone(event_loop),
                fd: Cell::new(-1),
                token: Cell::new(None),
                port: Cell::new(0),
                accept_callback: Box::new(accept_callback),
                error_callback: Box::new(error_callback),
            }),
        }
    }

    /// Binds to `0.0.0.0:port`. Port 0 selects an ephemeral port, readable
    /// afterwards via [`port`](Self::port).
    ///
    /// # Errors
    ///
    /// Returns an error if socket setup or the bind fails.
    pub fn bind(&self, port: u16) -> Result<(), Error> {
        self.bind_addr("0.0.0.0", port)
    }

    /// Binds to an IPv4 dotted-quad literal and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the literal does not parse or socket setup or
    /// the bind fails.
    ///
    /// # Panics
    ///
    /// Panics if the listener is already bound.
    pub fn bind_addr(&self, ip: &str, port: u16) -> Result<(), Error> {
        assert_eq!(self.inner.fd.get(), -1, "listener is already bound");
        let addr: Ipv4Addr = ip.parse().map_err(|_| Error::InvalidAddress {
            literal: ip.to_owned(),
        })?;
        let fd = socket::socket_v4().map_err(|e| Error::io("create socket", e))?;
        if let Err(err) = socket::set_nonblocking(fd) {
            socket::close(fd);
            return Err(Error::io("set socket non-blocking", err));
        }
        if let Err(err) = socket::set_reuseaddr(fd) {
            socket::close(fd);
            return Err(Error::io("set socket reusable", err));
        }
        if let Err(err) = socket::bind_v4(fd, addr, port) {
            socket::close(fd);
            return Err(Error::io("bind socket", err));
        }
        // Resolve the bound port in case an ephemeral one was requested.
        let bound_port = match socket::local_port(fd) {
            Ok(port) => port,
            Err(err) => {
                socket::close(fd);
                return Err(Error::io("resolve bound port", err));
            }
        };
        self.inner.fd.set(fd);
        self.inner.port.set(bound_port);
        tracing::debug!(fd, %addr, port = bound_port, "listener bound");
        Ok(())
    }

    /// Starts the kernel listen queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen call fails.
    ///
    /// # Panics
    ///
    /// Panics if the listener is not bound.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        assert_ne!(self.inner.fd.get(), -1, "listener is not bound");
        socket::listen(self.inner.fd.get(), backlog).map_err(|e| Error::io("listen", e))
    }

    /// Subscribes the accept handler. Each readiness edge accepts one
    /// connection and invokes the accept callback with its descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the registration.
    ///
    /// # Panics
    ///
    /// Panics if the listener is not bound.
    pub fn start_accepting(&self) -> Result<(), Error> {
        assert_ne!(self.inner.fd.get(), -1, "listener is not bound");
        if self.inner.token.get().is_some() {
            return Ok(());
        }
        let handler: Rc<dyn EventHandler> = Rc::clone(&self.inner) as Rc<dyn EventHandler>;
        let token = self
            .inner
            .event_loop
            .register_handler(handler, Interest::READABLE)?;
        self.inner.token.set(Some(token));
        Ok(())
    }

    /// Unsubscribes the accept handler; pending connections stay queued in
    /// the kernel.
    pub fn stop_accepting(&self) {
        if let Some(token) = self.inner.token.take() {
            self.inner.event_loop.unregister_handler(token);
        }
    }

    /// The bound port, once [`bind`](Self::bind) has succeeded.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port.get()
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop_accepting();
        let fd = self.inner.fd.replace(-1);
        if fd >= 0 {
            socket::close(fd);
        }
    }
}

impl std::fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("fd", &self.inner.fd.get())
            .field("port", &self.inner.port.get())
            .field("accepting", &self.inner.token.get().is_some())
            .finish()
    }
}

impl EventHandler for ListenerInner {
    fn fd(&self) -> RawFd {
        self.fd.get()
    }

    fn ready(&self, _events: Interest) {
        match socket::accept(self.fd.get()) {
            Ok(client) => {
                if let Err(err) = socket::set_nonblocking(client) {
                    socket::close(client);
                    (self.error_callback)(&Error::io("set accepted socket non-blocking", err));
                    return;
                }
                tracing::debug!(listener = self.fd.get(), client, "accepted connection");
                (self.accept_callback)(client);
            }
            // A spurious edge or a connection the peer already aborted;
            // the next edge will retry.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => (self.error_callback)(&Error::io("accept connection", err)),
        }
    }
}

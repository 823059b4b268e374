//! Full-duplex non-blocking TCP byte stream.
//!
//! A [`Stream`] wraps one descriptor registered on one event loop and
//! translates readiness into user callbacks:
//!
//! - [`WriteCallback`]: per queued write, completion or error.
//! - [`ReadCallback`]: new inbound bytes, error, or end of stream.
//! - [`ConnectCallback`]: outcome of an in-flight connect.
//!
//! Writes are queued as requests, each owning a buffer, and drained in FIFO
//! order with vectored sends on every write-ready edge; a short write
//! parks the queue until the next edge. The readiness subscription always
//! equals "writes pending → WRITE" plus "read callback installed → READ"
//! (plus WRITE while a connect is pending), so an idle stream costs the
//! poller nothing.
//!
//! The inbound buffer is shared with the read callback by exclusive
//! reference: the callback drains whatever prefix it wants, undrained bytes
//! are re-offered together with the next arrival, and the callback is not
//! invoked again until new bytes arrive.
//!
//! All methods must be called on the stream's loop thread.

use crate::buffer::Buffer;
use crate::error::Error;
use crate::event_loop::{EventHandler, EventLoop, Token};
use crate::interest::Interest;
use crate::net::socket;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Bytes pulled per read syscall on the inbound path.
const READ_CHUNK: usize = 4096;

/// Completion interface for a queued write.
pub trait WriteCallback {
    /// The request's buffer was fully written to the socket.
    fn complete(&self);

    /// Writing the request failed; the stream stops draining its queue.
    fn error(&self, error: &Error);
}

/// Delivery interface for inbound bytes.
pub trait ReadCallback {
    /// New bytes were appended to the inbound buffer. Drain any prefix;
    /// whatever remains is re-offered when more bytes arrive.
    fn available(&self, buffer: &mut Buffer);

    /// Reading failed. Delivered at most once; READ interest is dropped.
    fn error(&self, error: &Error);

    /// The peer closed the stream. Delivered at most once.
    fn eof(&self);
}

/// Outcome interface for [`Stream::connect`].
pub trait ConnectCallback {
    /// The connection is established.
    fn complete(&self);

    /// The connection failed or the stream was closed first.
    fn error(&self, error: &Error);
}

struct WriteRequest {
    buffer: Buffer,
    callback: Option<Rc<dyn WriteCallback>>,
}

enum WriteStep {
    Completed,
    Blocked,
    Failed(io::Error),
}

/// A full-duplex byte stream on an event loop.
///
/// Obtain one with [`Stream::wrap`] (an already-connected non-blocking
/// descriptor) or [`Stream::create`] + [`Stream::connect`]. The handle is
/// unique: dropping it unregisters the handler, closes the descriptor if
/// still open, and discards queued writes without invoking their callbacks.
pub struct Stream {
    inner: Rc<StreamInner>,
}

struct StreamInner {
    event_loop: Rc<EventLoop>,
    fd: Cell<RawFd>,
    token: Cell<Option<Token>>,
    watched: Cell<Interest>,
    requests: RefCell<VecDeque<WriteRequest>>,
    read_callback: RefCell<Option<Rc<dyn ReadCallback>>>,
    connect_callback: RefCell<Option<Rc<dyn ConnectCallback>>>,
    inbound: RefCell<Buffer>,
    closed: Cell<bool>,
}

impl Stream {
    /// Wraps an already-connected descriptor. The descriptor must be in
    /// non-blocking mode.
    #[must_use]
    pub fn wrap(event_loop: &Rc<EventLoop>, fd: RawFd) -> Stream {
        Stream {
            inner: Rc::new(StreamInner {
                event_loop: Rc::clone(event_loop),
                fd: Cell::new(fd),
                token: Cell::new(None),
                watched: Cell::new(Interest::NONE),
                requests: RefCell::new(VecDeque::new()),
                read_callback: RefCell::new(None),
                connect_callback: RefCell::new(None),
                inbound: RefCell::new(Buffer::new()),
                closed: Cell::new(false),
            }),
        }
    }

    /// Creates an unconnected stream; establish it with
    /// [`connect`](Self::connect) before use.
    #[must_use]
    pub fn create(event_loop: &Rc<EventLoop>) -> Stream {
        Self::wrap(event_loop, -1)
    }

    /// The wrapped descriptor, or -1 before connect / after close.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.inner.fd.get()
    }

    /// The readiness currently subscribed for this stream's handler.
    #[must_use]
    pub fn watched(&self) -> Interest {
        self.inner.watched.get()
    }

    /// Queues `data` for writing. `callback`, if given, fires when the
    /// whole block has been written, or on failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the readiness registration.
    pub fn write(&self, data: &[u8], callback: Option<Rc<dyn WriteCallback>>) -> Result<(), Error> {
        let mut buffer = Buffer::new();
        buffer.append(data);
        self.queue_request(WriteRequest { buffer, callback })
    }

    /// Queues the contents of `source` for writing, leaving `source` empty.
    /// The bytes are spliced, not copied.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the readiness registration.
    pub fn write_buffer(
        &self,
        source: &mut Buffer,
        callback: Option<Rc<dyn WriteCallback>>,
    ) -> Result<(), Error> {
        let mut buffer = Buffer::new();
        buffer.append_buffer(source);
        self.queue_request(WriteRequest { buffer, callback })
    }

    fn queue_request(&self, request: WriteRequest) -> Result<(), Error> {
        if self.inner.closed.get() {
            return Ok(());
        }
        self.inner.requests.borrow_mut().push_back(request);
        Self::set_interest(&self.inner, self.inner.watched.get().add(Interest::WRITABLE))
    }

    /// Installs the read callback and subscribes READ.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the readiness registration.
    pub fn start_read(&self, callback: Rc<dyn ReadCallback>) -> Result<(), Error> {
        if self.inner.closed.get() {
            return Ok(());
        }
        *self.inner.read_callback.borrow_mut() = Some(Rc::clone(&callback));
        Self::set_interest(&self.inner, self.inner.watched.get().add(Interest::READABLE))?;
        // Bytes a previous callback left undrained are offered right away;
        // readiness alone would only resurface them after the next arrival.
        if let Ok(mut inbound) = self.inner.inbound.try_borrow_mut() {
            if !inbound.is_empty() {
                callback.available(&mut inbound);
            }
        }
        Ok(())
    }

    /// Clears the read callback and unsubscribes READ, preserving WRITE.
    /// No read callback fires after this returns.
    pub fn stop_read(&self) {
        if self.inner.read_callback.borrow_mut().take().is_none() {
            return;
        }
        self.inner
            .shrink_interest(self.inner.watched.get().remove(Interest::READABLE));
    }

    /// Connects to `ip:port` (IPv4 dotted-quad literal).
    ///
    /// Every outcome is reported through `callback`: immediate success or
    /// failure inline, a pending connect on the following write-ready edge
    /// via `SO_ERROR`.
    ///
    /// # Panics
    ///
    /// Panics if the stream already has a descriptor or a pending connect.
    pub fn connect(&self, ip: &str, port: u16, callback: Rc<dyn ConnectCallback>) {
        assert_eq!(self.inner.fd.get(), -1, "stream is already connected");
        assert!(
            self.inner.connect_callback.borrow().is_none(),
            "connect is already pending"
        );
        if self.inner.closed.get() {
            callback.error(&Error::ClosedBeforeConnect);
            return;
        }

        let addr: Ipv4Addr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                callback.error(&Error::InvalidAddress {
                    literal: ip.to_owned(),
                });
                return;
            }
        };
        let fd = match socket::socket_v4() {
            Ok(fd) => fd,
            Err(err) => {
                callback.error(&Error::io("create socket", err));
                return;
            }
        };
        if let Err(err) = socket::set_nonblocking(fd) {
            socket::close(fd);
            callback.error(&Error::io("set socket non-blocking", err));
            return;
        }

        match socket::connect_v4(fd, addr, port) {
            Ok(()) => {
                self.inner.fd.set(fd);
                tracing::debug!(fd, %addr, port, "connect completed immediately");
                callback.complete();
            }
            Err(err) if connect_in_progress(&err) => {
                self.inner.fd.set(fd);
                *self.inner.connect_callback.borrow_mut() = Some(Rc::clone(&callback));
                match Self::set_interest(
                    &self.inner,
                    self.inner.watched.get().add(Interest::WRITABLE),
                ) {
                    Ok(()) => tracing::debug!(fd, %addr, port, "connect pending"),
                    Err(error) => {
                        self.inner.connect_callback.borrow_mut().take();
                        callback.error(&error);
                    }
                }
            }
            Err(err) => {
                socket::close(fd);
                callback.error(&Error::io("connect", err));
            }
        }
    }

    /// Closes the stream: fires `eof` on an installed read callback and a
    /// closed-before-connect error on a pending connect, unregisters the
    /// handler, and closes the descriptor. Idempotent; after the first
    /// close every stream operation is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Grows or installs the readiness registration. Needs the `Rc` so the
    /// first subscription can hand the handler to the loop.
    fn set_interest(inner: &Rc<StreamInner>, interest: Interest) -> Result<(), Error> {
        if interest == inner.watched.get() {
            return Ok(());
        }
        if interest.is_empty() {
            if let Some(token) = inner.token.take() {
                inner.event_loop.unregister_handler(token);
            }
        } else if let Some(token) = inner.token.get() {
            inner.event_loop.update_handler(token, interest)?;
        } else {
            let handler: Rc<dyn EventHandler> = Rc::clone(inner) as Rc<dyn EventHandler>;
            let token = inner.event_loop.register_handler(handler, interest)?;
            inner.token.set(Some(token));
        }
        inner.watched.set(interest);
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("fd", &self.inner.fd.get())
            .field("watched", &self.inner.watched.get())
            .field("pending_writes", &self.inner.requests.borrow().len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

impl StreamInner {
    /// Narrows or drops the registration. Registration must already exist,
    /// so this is callable from inside `ready` without the `Rc`.
    fn shrink_interest(&self, interest: Interest) {
        if interest == self.watched.get() {
            return;
        }
        if interest.is_empty() {
            if let Some(token) = self.token.take() {
                self.event_loop.unregister_handler(token);
            }
        } else if let Some(token) = self.token.get() {
            if let Err(error) = self.event_loop.update_handler(token, interest) {
                tracing::warn!(fd = self.fd.get(), %error, "failed to narrow interest");
            }
        }
        self.watched.set(interest);
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let read_callback = self.read_callback.borrow_mut().take();
        if let Some(callback) = read_callback {
            callback.eof();
        }
        let connect_callback = self.connect_callback.borrow_mut().take();
        if let Some(callback) = connect_callback {
            callback.error(&Error::ClosedBeforeConnect);
        }
        if let Some(token) = self.token.take() {
            self.event_loop.unregister_handler(token);
        }
        self.watched.set(Interest::NONE);
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            socket::close(fd);
        }
    }

    /// Drop path: release everything without invoking callbacks. A callback
    /// after destruction would be a use of freed user state.
    fn teardown(&self) {
        self.read_callback.borrow_mut().take();
        self.connect_callback.borrow_mut().take();
        self.requests.borrow_mut().clear();
        if self.closed.replace(true) {
            return;
        }
        if let Some(token) = self.token.take() {
            self.event_loop.unregister_handler(token);
        }
        self.watched.set(Interest::NONE);
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            socket::close(fd);
        }
    }

    fn finish_connect(&self) {
        let Some(callback) = self.connect_callback.borrow_mut().take() else {
            return;
        };
        match socket::take_socket_error(self.fd.get()) {
            Ok(None) => {
                tracing::debug!(fd = self.fd.get(), "connect completed");
                callback.complete();
            }
            Ok(Some(err)) => {
                tracing::debug!(fd = self.fd.get(), error = %err, "connect failed");
                callback.error(&Error::ConnectFailed { source: err });
            }
            Err(err) => callback.error(&Error::io("query connection status", err)),
        }
    }

    /// Drains the write queue while the socket keeps accepting bytes.
    ///
    /// Callbacks run with no internal borrow held, so they may queue more
    /// writes, close the stream, or drop it. WRITE interest is cleared
    /// *before* the completion of the request that empties the queue; that
    /// callback is allowed to free the stream, and the registration must
    /// not outlive it.
    fn flush_writes(&self) {
        loop {
            if self.closed.get() {
                return;
            }
            let mut requests = self.requests.borrow_mut();
            let Some(front) = requests.front_mut() else {
                drop(requests);
                // Write-ready with nothing queued (a connect just
                // completed): drop WRITE so a level-triggered poller does
                // not spin on an always-writable socket.
                self.shrink_interest(self.watched.get().remove(Interest::WRITABLE));
                return;
            };

            let extents = front.buffer.peek_extents(usize::MAX);
            let result = socket::write_vectored(self.fd.get(), &extents);
            drop(extents);
            let step = match result {
                Ok(written) => {
                    front.buffer.drain(written);
                    if front.buffer.is_empty() {
                        WriteStep::Completed
                    } else {
                        // Short write: the socket buffer is full.
                        WriteStep::Blocked
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => WriteStep::Blocked,
                Err(err) => WriteStep::Failed(err),
            };

            match step {
                WriteStep::Blocked => return,
                WriteStep::Completed => {
                    let request = requests.pop_front().expect("front request exists");
                    let drained = requests.is_empty();
                    drop(requests);
                    if drained {
                        self.shrink_interest(self.watched.get().remove(Interest::WRITABLE));
                    }
                    if let Some(callback) = request.callback {
                        callback.complete();
                    }
                }
                WriteStep::Failed(err) => {
                    let request = requests.pop_front().expect("front request exists");
                    let drained = requests.is_empty();
                    drop(requests);
                    if drained {
                        self.shrink_interest(self.watched.get().remove(Interest::WRITABLE));
                    }
                    tracing::debug!(fd = self.fd.get(), error = %err, "write failed");
                    if let Some(callback) = request.callback {
                        callback.error(&Error::io("write", err));
                    }
                    return;
                }
            }
        }
    }

    /// Reads until would-block, appending to the inbound buffer and
    /// offering it to the read callback after every arrival.
    fn pump_reads(&self) {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            if self.read_callback.borrow().is_none() {
                return;
            }
            match socket::read(self.fd.get(), &mut scratch) {
                Ok(0) => {
                    // Take the callback and drop READ first: eof is
                    // delivered exactly once, and a level-triggered poller
                    // would otherwise re-report the closed peer forever.
                    let callback = self.read_callback.borrow_mut().take();
                    self.shrink_interest(self.watched.get().remove(Interest::READABLE));
                    tracing::debug!(fd = self.fd.get(), "stream reached eof");
                    if let Some(callback) = callback {
                        callback.eof();
                    }
                    return;
                }
                Ok(n) => {
                    self.inbound.borrow_mut().append(&scratch[..n]);
                    let callback = self.read_callback.borrow().clone();
                    if let Some(callback) = callback {
                        let mut inbound = self.inbound.borrow_mut();
                        callback.available(&mut inbound);
                    }
                    if self.closed.get() {
                        return;
                    }
                    if n < READ_CHUNK {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    let callback = self.read_callback.borrow_mut().take();
                    self.shrink_interest(self.watched.get().remove(Interest::READABLE));
                    tracing::debug!(fd = self.fd.get(), error = %err, "read failed");
                    if let Some(callback) = callback {
                        callback.error(&Error::io("read", err));
                    }
                    return;
                }
            }
        }
    }
}

impl EventHandler for StreamInner {
    fn fd(&self) -> RawFd {
        self.fd.get()
    }

    fn ready(&self, events: Interest) {
        if self.closed.get() {
            return;
        }
        if events.is_writable() {
            let connecting = self.connect_callback.borrow().is_some();
            if connecting {
                self.finish_connect();
            }
            if self.closed.get() {
                return;
            }
            self.flush_writes();
        }
        if self.closed.get() {
            return;
        }
        if events.is_readable() {
            self.pump_reads();
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

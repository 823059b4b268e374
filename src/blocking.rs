//! Blocking façade over a stream.
//!
//! [`BlockingStream`] owns a private event loop and a wrapped descriptor,
//! and turns the callback API into ordinary blocking calls: `write` drives
//! the loop until the queued write completes, `read` drives single poll
//! passes until enough bytes, end of stream, or an error arrive. Useful for
//! tests and for threads that talk to a socket without running a loop of
//! their own.

use crate::buffer::Buffer;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopMode};
use crate::net::socket;
use crate::net::stream::{ReadCallback, Stream, WriteCallback};
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

/// A connected descriptor with blocking read/write semantics.
///
/// The descriptor is put into non-blocking mode (the private loop depends
/// on it) and closed when the façade is dropped.
pub struct BlockingStream {
    stream: Stream,
    event_loop: Rc<EventLoop>,
}

#[derive(Default)]
struct FlagWriteCallback {
    completed: Cell<bool>,
    failure: RefCell<Option<String>>,
}

impl WriteCallback for FlagWriteCallback {
    fn complete(&self) {
        self.completed.set(true);
    }

    fn error(&self, error: &Error) {
        *self.failure.borrow_mut() = Some(error.to_string());
    }
}

struct CollectReadCallback {
    target: usize,
    data: RefCell<Vec<u8>>,
    eof: Cell<bool>,
    failure: RefCell<Option<String>>,
}

impl ReadCallback for CollectReadCallback {
    fn available(&self, buffer: &mut Buffer) {
        let mut data = self.data.borrow_mut();
        let want = self.target - data.len();
        if want == 0 {
            return;
        }
        // Take only what this read asked for; surplus bytes stay buffered
        // in the stream for the next call.
        let mut chunk = vec![0u8; want.min(buffer.size())];
        let n = buffer.read(&mut chunk);
        data.extend_from_slice(&chunk[..n]);
    }

    fn error(&self, error: &Error) {
        *self.failure.borrow_mut() = Some(error.to_string());
    }

    fn eof(&self) {
        self.eof.set(true);
    }
}

impl BlockingStream {
    /// Wraps a connected descriptor in a private loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop cannot be created or the descriptor
    /// cannot be made non-blocking.
    pub fn new(fd: RawFd) -> Result<Self, Error> {
        let event_loop = EventLoop::new()?;
        socket::set_nonblocking(fd).map_err(|e| Error::io("set descriptor non-blocking", e))?;
        let stream = Stream::wrap(&event_loop, fd);
        Ok(Self { stream, event_loop })
    }

    /// Writes the whole block, blocking until it is on the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        let callback = Rc::new(FlagWriteCallback::default());
        self.stream.write(data, Some(callback.clone()))?;
        self.event_loop.run(LoopMode::UntilEmpty);
        if let Some(message) = callback.failure.borrow_mut().take() {
            return Err(Error::io("blocking write", io::Error::other(message)));
        }
        debug_assert!(callback.completed.get(), "write neither completed nor failed");
        Ok(())
    }

    /// Reads until `out` is full, the peer closes, or an error occurs.
    /// Returns the number of bytes read (possibly short on end of stream).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, Error> {
        let callback = Rc::new(CollectReadCallback {
            target: out.len(),
            data: RefCell::new(Vec::with_capacity(out.len())),
            eof: Cell::new(false),
            failure: RefCell::new(None),
        });
        self.stream.start_read(callback.clone())?;
        while callback.data.borrow().len() < out.len()
            && !callback.eof.get()
            && callback.failure.borrow().is_none()
        {
            self.event_loop.run(LoopMode::Once);
        }
        self.stream.stop_read();

        if let Some(message) = callback.failure.borrow_mut().take() {
            return Err(Error::io("blocking read", io::Error::other(message)));
        }
        let data = callback.data.borrow();
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl std::fmt::Debug for BlockingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingStream")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

//! A callback-driven, single-threaded TCP networking runtime.
//!
//! Netloop turns raw non-blocking descriptors into a composable
//! asynchronous stream API without futures or threads-per-connection:
//!
//! - [`EventLoop`]: a single-threaded readiness loop with timer dispatch
//!   and a lock-free cross-thread injection queue ([`mpsc`]), woken through
//!   an internal eventfd/pipe handler.
//! - [`EventHandler`]: the descriptor+readiness callback registered on a
//!   loop; [`Interest`] names what it watches.
//! - [`Buffer`]: a chunked byte buffer whose extents feed vectored reads
//!   and writes without copying.
//! - [`Stream`]: a full-duplex TCP byte pipe with explicit callbacks for
//!   connect, write completion, inbound bytes, end of stream, and errors.
//! - [`ConnectionListener`]: a non-blocking accept loop handing raw
//!   descriptors to the user — hand them to another loop's [`Stream`] for
//!   multi-core fan-out.
//! - [`BlockingStream`]: a façade driving a private loop for code that
//!   wants plain blocking reads and writes.
//!
//! One thread drives a loop at a time; every callback runs on that thread,
//! to completion. Other threads interact solely through [`LoopHandle`]:
//! `stop`, `run_on_event_loop`, `run_on_event_loop_and_wait`.
//!
//! # Example
//!
//! ```no_run
//! use netloop::{ConnectionListener, EventLoop, LoopMode};
//!
//! let event_loop = EventLoop::new()?;
//! let listener = ConnectionListener::new(
//!     &event_loop,
//!     |fd| println!("accepted descriptor {fd}"),
//!     |error| eprintln!("accept failed: {error}"),
//! );
//! listener.bind(0)?;
//! listener.listen(128)?;
//! listener.start_accepting()?;
//! println!("listening on {}", listener.port());
//! event_loop.run(LoopMode::Forever);
//! # Ok::<(), netloop::Error>(())
//! ```

pub mod blocking;
pub mod buffer;
pub mod error;
pub mod event_loop;
pub mod interest;
pub mod mpsc;
pub mod net;
mod poller;
mod timer;

pub use blocking::BlockingStream;
pub use buffer::Buffer;
pub use error::Error;
pub use event_loop::{EventHandler, EventLoop, LoopHandle, LoopMode, TimeoutToken, Token};
pub use interest::Interest;
pub use net::{ConnectCallback, ConnectionListener, ReadCallback, Stream, WriteCallback};

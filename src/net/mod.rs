//! TCP networking on top of the event loop: streams, listeners, and the
//! raw-socket helpers they are built from.

pub mod listener;
pub mod socket;
pub mod stream;

pub use listener::ConnectionListener;
pub use stream::{ConnectCallback, ReadCallback, Stream, WriteCallback};

//! Error types for the event loop and its network primitives.
//!
//! Construction failures (socket setup, poller setup) are returned as
//! `Result`s; runtime I/O failures are delivered to the relevant callback
//! as `&Error`. Messages are human-readable; there are no stable numeric
//! error codes.

use std::io;
use thiserror::Error;

/// Errors produced by the event loop, streams, and listeners.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying system call failed.
    #[error("{context}: {source}")]
    Io {
        /// What the runtime was doing when the call failed.
        context: &'static str,
        /// The source I/O error.
        source: io::Error,
    },

    /// An address literal could not be parsed as IPv4 dotted-quad.
    #[error("invalid IPv4 address literal: {literal:?}")]
    InvalidAddress {
        /// The rejected literal.
        literal: String,
    },

    /// The connection attempt was reported failed by the kernel.
    #[error("connect failed: {source}")]
    ConnectFailed {
        /// The error read back from `SO_ERROR`.
        source: io::Error,
    },

    /// The stream was closed while a connect was still pending.
    #[error("stream closed before connect completed")]
    ClosedBeforeConnect,
}

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }
}

//! Error taxonomy for dispatchers and the event loop.
//!
//! Would-block is not an error here: low-level calls report it through
//! [`IoOutcome::WouldBlock`](crate::runtime::IoOutcome) and it is retried on a
//! later iteration. Everything below except [`Error::Shutdown`] and
//! [`Error::Poll`] is absorbed inside the loop and reported through the
//! affected dispatcher's `handle_error` hook.

use std::io;
use thiserror::Error;

/// Result alias used by hooks and dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer performed an orderly shutdown.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Fatal OS-level error on a descriptor.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// An application hook failed or panicked.
    #[error("handler fault: {0}")]
    Handler(String),

    /// The operation needs an open descriptor.
    #[error("dispatcher is closed")]
    Closed,

    /// The dispatcher is inside one of its own hooks. Reaching it through a
    /// handle at that point would alias the `&mut Dispatcher` the hook holds.
    #[error("dispatcher is busy running a hook")]
    Busy,

    /// Socket operation requested on a descriptor that is not a socket.
    #[error("{0} is not supported by this descriptor")]
    Unsupported(&'static str),

    /// Appending would push the outgoing buffer past its high-water mark.
    #[error("outgoing buffer full: {buffered} buffered + {incoming} new > {limit}")]
    Backpressure {
        buffered: usize,
        incoming: usize,
        limit: usize,
    },

    /// The readiness primitive itself failed.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// External shutdown request. Never absorbed by the loop.
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// Build a handler fault from any displayable message.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Error::Handler(msg.to_string())
    }

    /// Whether this error must terminate the loop.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

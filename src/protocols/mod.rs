//! Line protocols served by the demo binary.
//!
//! - `ping`: `PING` / `PONG`, for health checks and latency measurement
//! - `echo`: length-prefixed echo, for throughput and partial-I/O testing
//!
//! Both are ordinary [`Handler`]s. [`Acceptor`] sits on the listening
//! dispatcher and registers one session per accepted connection.

pub mod echo;
pub mod ping;

use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, Handler, SocketDescriptor};
use std::net::SocketAddr;
use tracing::{debug, error, warn};

pub use echo::EchoSession;
pub use ping::PingSession;

/// Listening-side handler that builds a session per connection.
pub struct Acceptor<F> {
    new_session: F,
    high_water: Option<usize>,
    max_connections: Option<usize>,
}

impl<F> Acceptor<F> {
    pub fn new(new_session: F) -> Self {
        Self {
            new_session,
            high_water: None,
            max_connections: None,
        }
    }

    /// Outgoing high-water mark applied to every accepted connection.
    pub fn with_high_water(mut self, limit: Option<usize>) -> Self {
        self.high_water = limit;
        self
    }

    /// Refuse connections once this many are registered alongside the
    /// listener.
    pub fn with_max_connections(mut self, limit: Option<usize>) -> Self {
        self.max_connections = limit;
        self
    }
}

impl<F, H> Handler for Acceptor<F>
where
    F: FnMut() -> H + 'static,
    H: Handler,
{
    fn handle_accept(&mut self, d: &mut Dispatcher) -> Result<()> {
        // Drain the backlog; the listener is level-triggered either way.
        while let Some((socket, peer)) = d.accept()? {
            self.handle_accepted(d, socket, peer)?;
        }
        Ok(())
    }

    fn handle_accepted(
        &mut self,
        d: &mut Dispatcher,
        socket: SocketDescriptor,
        peer: SocketAddr,
    ) -> Result<()> {
        let registry = d.registry().ok_or(Error::Closed)?;
        if let Some(max) = self.max_connections {
            if registry.len() > max {
                warn!(peer = %peer, max, "Connection limit reached");
                return Ok(());
            }
        }

        let mut conn = Dispatcher::connected(socket, &registry);
        conn.set_high_water(self.high_water);
        let handle = conn.register((self.new_session)())?;
        debug!(peer = %peer, token = ?handle.token(), "Accepted connection");
        Ok(())
    }

    /// A failed accept must not take the listener down.
    fn handle_error(&mut self, d: &mut Dispatcher, err: &Error) {
        error!(token = ?d.token(), error = %err, "Accept failed");
    }
}

/// Position of the first `\r\n`, pointing at the `\r`.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

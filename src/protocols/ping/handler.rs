//! Ping session handler.

use super::parser::{self, Command, Frame};
use crate::error::Result;
use crate::runtime::{Dispatcher, Handler};
use tracing::{debug, trace};

/// One ping connection.
///
/// Requests are answered in order. After `QUIT` (or an over-long line) the
/// session stops reading, flushes what is queued, and closes.
#[derive(Debug, Default)]
pub struct PingSession {
    quitting: bool,
}

impl PingSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn process(&mut self, d: &mut Dispatcher) -> Result<()> {
        let mut reply = Vec::new();
        let mut consumed = 0;

        while !self.quitting {
            match parser::parse(&d.incoming()[consumed..]) {
                Frame::Complete(command, n) => {
                    consumed += n;
                    trace!(token = ?d.token(), ?command, "ping request");
                    parser::encode_reply(command, &mut reply);
                    if command == Command::Quit {
                        self.quitting = true;
                    }
                }
                Frame::Unknown(n) => {
                    consumed += n;
                    reply.extend_from_slice(parser::UNKNOWN_COMMAND);
                }
                Frame::TooLong => {
                    debug!(token = ?d.token(), "Request line too long");
                    consumed = d.incoming().len();
                    reply.extend_from_slice(parser::LINE_TOO_LONG);
                    self.quitting = true;
                }
                Frame::Incomplete => break,
            }
        }

        d.consume_incoming(consumed);
        if !reply.is_empty() {
            d.write_data(&reply)?;
        }
        self.close_if_drained(d);
        Ok(())
    }

    fn close_if_drained(&self, d: &mut Dispatcher) {
        if self.quitting && d.outgoing_len() == 0 {
            d.close();
        }
    }
}

impl Handler for PingSession {
    fn readable(&self, d: &Dispatcher) -> bool {
        !self.quitting && d.default_readable()
    }

    fn handle_read(&mut self, d: &mut Dispatcher) -> Result<()> {
        d.read_chunk()?;
        if d.is_closed() {
            return Ok(());
        }
        self.process(d)
    }

    fn handle_write(&mut self, d: &mut Dispatcher) -> Result<()> {
        d.flush()?;
        self.close_if_drained(d);
        Ok(())
    }
}

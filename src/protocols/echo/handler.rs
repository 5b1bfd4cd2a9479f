//! Echo session handler.

use super::parser::{self, Frame};
use crate::error::Result;
use crate::runtime::{Dispatcher, Handler};
use tracing::trace;

/// One echo connection. Payloads are echoed back in request order.
#[derive(Debug, Default)]
pub struct EchoSession {
    quitting: bool,
    echoed: u64,
}

impl EchoSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes echoed so far.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    fn process(&mut self, d: &mut Dispatcher) -> Result<()> {
        let mut reply = Vec::new();
        let mut consumed = 0;

        while !self.quitting {
            match parser::parse(&d.incoming()[consumed..]) {
                Frame::Echo(payload, n) => {
                    trace!(token = ?d.token(), len = payload.len(), "echo request");
                    parser::encode_echo(payload, &mut reply);
                    self.echoed += payload.len() as u64;
                    consumed += n;
                }
                Frame::Quit(n) => {
                    consumed += n;
                    reply.extend_from_slice(b"OK\r\n");
                    self.quitting = true;
                }
                Frame::InvalidLength(n) => {
                    consumed += n;
                    parser::encode_error("invalid length", &mut reply);
                }
                Frame::TooLarge(n) => {
                    consumed += n;
                    parser::encode_error("payload too large", &mut reply);
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

impl Handler for EchoSession {
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

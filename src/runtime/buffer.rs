//! Per-dispatcher byte queues.
//!
//! `IncomingBuffer` accumulates bytes read from the descriptor until the
//! application consumes them. `OutgoingBuffer` holds bytes queued by
//! `write_data` until a send accepts them. Partial sends only ever drop the
//! transmitted prefix, so the peer sees every byte exactly once and in order.

use crate::error::{Error, Result};
use crate::runtime::descriptor::{Descriptor, IoOutcome};
use bytes::{Buf, BytesMut};

/// Bytes received and not yet consumed by the application.
#[derive(Debug, Default)]
pub struct IncomingBuffer {
    data: BytesMut,
}

impl IncomingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read at most `chunk` bytes from `desc` and append them.
    ///
    /// The buffer is left unchanged unless the read returned data.
    pub fn fill_from(&mut self, desc: &mut dyn Descriptor, chunk: usize) -> IoOutcome {
        let start = self.data.len();
        self.data.resize(start + chunk, 0);

        let outcome = desc.recv(&mut self.data[start..]);
        let filled = match outcome {
            IoOutcome::Ready(n) => n,
            _ => 0,
        };
        self.data.truncate(start + filled);
        outcome
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n.min(self.data.len()));
    }

    /// Take everything buffered so far.
    pub fn take(&mut self) -> BytesMut {
        self.data.split()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Bytes queued for transmission.
///
/// Unbounded unless a high-water mark is set.
#[derive(Debug, Default)]
pub struct OutgoingBuffer {
    data: BytesMut,
    high_water: Option<usize>,
}

impl OutgoingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            high_water: Some(limit),
        }
    }

    pub fn set_high_water(&mut self, limit: Option<usize>) {
        self.high_water = limit;
    }

    pub fn high_water(&self) -> Option<usize> {
        self.high_water
    }

    /// Append a chunk. Rejects the whole chunk if it would cross the
    /// high-water mark.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(limit) = self.high_water {
            if self.data.len() + bytes.len() > limit {
                return Err(Error::Backpressure {
                    buffered: self.data.len(),
                    incoming: bytes.len(),
                    limit,
                });
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Send as much of the queue as `desc` accepts in one call.
    ///
    /// On `Ready(n)` the first `n` bytes are dropped; otherwise the queue is
    /// untouched.
    pub fn drain_into(&mut self, desc: &mut dyn Descriptor) -> IoOutcome {
        if self.data.is_empty() {
            return IoOutcome::Ready(0);
        }
        let outcome = desc.send(&self.data);
        if let IoOutcome::Ready(n) = outcome {
            self.data.advance(n.min(self.data.len()));
        }
        outcome
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

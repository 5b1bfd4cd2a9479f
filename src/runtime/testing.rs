//! In-memory descriptor with scripted behavior for deterministic tests.

use crate::runtime::descriptor::{Descriptor, IoOutcome};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

#[derive(Debug, Default)]
pub(crate) struct Script {
    /// Pending inbound chunks.
    pub inbound: VecDeque<Vec<u8>>,
    /// Report end of stream once `inbound` is drained.
    pub eof: bool,
    /// Fail the next recv with this errno.
    pub recv_errno: Option<i32>,
    /// Maximum bytes accepted per send.
    pub send_limit: Option<usize>,
    /// Report would-block on every send.
    pub block_sends: bool,
    /// Everything accepted by send so far.
    pub sent: Vec<u8>,
    /// Number of send calls made.
    pub send_calls: usize,
    /// Number of times the descriptor was closed.
    pub closed: usize,
}

impl Script {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.push_back(bytes.to_vec());
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedDescriptor {
    script: Rc<RefCell<Script>>,
}

impl ScriptedDescriptor {
    pub fn new() -> (Self, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        (
            Self {
                script: Rc::clone(&script),
            },
            script,
        )
    }
}

impl Descriptor for ScriptedDescriptor {
    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        let mut guard = self.script.borrow_mut();
        let script = &mut *guard;
        if let Some(errno) = script.recv_errno.take() {
            return IoOutcome::Error(io::Error::from_raw_os_error(errno));
        }
        if let Some(front) = script.inbound.front_mut() {
            let n = buf.len().min(front.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            if front.is_empty() {
                script.inbound.pop_front();
            }
            return IoOutcome::Ready(n);
        }
        if script.eof {
            IoOutcome::Ready(0)
        } else {
            IoOutcome::WouldBlock
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        let mut guard = self.script.borrow_mut();
        let script = &mut *guard;
        script.send_calls += 1;
        if script.block_sends {
            return IoOutcome::WouldBlock;
        }
        let n = script.send_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        script.sent.extend_from_slice(&buf[..n]);
        IoOutcome::Ready(n)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.script.borrow_mut().closed += 1;
        Ok(())
    }
}

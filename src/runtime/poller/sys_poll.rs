//! `poll(2)` backend.
//!
//! Slot 0 of every wait is the read end of a self-pipe; a byte written to
//! the other end by [`Wakeup::wake`] ends the wait early.

use super::{Interest, Poller, Readiness, Wakeup, Watch};
use crate::runtime::file::{pipe, set_nonblocking};
use crate::runtime::registry::Token;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Both ends live together, so a wake never writes into a pipe whose
/// reader is gone.
pub(crate) struct SelfPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl SelfPipe {
    fn new() -> io::Result<Self> {
        let (rx, tx) = pipe()?;
        set_nonblocking(rx.as_raw_fd())?;
        set_nonblocking(tx.as_raw_fd())?;
        Ok(Self { rx, tx })
    }

    /// Swallow every pending wake-up byte.
    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is a valid writable region of buf.len() bytes.
            let n = unsafe { libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < buf.len() as libc::ssize_t {
                break;
            }
        }
    }
}

impl Wakeup for SelfPipe {
    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // SAFETY: byte is a valid readable region of one byte.
        let n = unsafe { libc::write(self.tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // Pipe full: a wake-up is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

pub(crate) struct SysPoll {
    fds: Vec<libc::pollfd>,
    wake: Arc<SelfPipe>,
}

impl SysPoll {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fds: Vec::new(),
            wake: Arc::new(SelfPipe::new()?),
        })
    }
}

fn events_for(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.read {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.write {
        events |= libc::POLLOUT;
    }
    events
}

/// Milliseconds for poll(2), rounded up so short timeouts never spin.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl Poller for SysPoll {
    fn poll(
        &mut self,
        watched: &[Watch],
        timeout: Duration,
        ready: &mut Vec<(Token, Readiness)>,
    ) -> io::Result<()> {
        self.fds.clear();
        self.fds.push(libc::pollfd {
            fd: self.wake.rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        self.fds.extend(watched.iter().map(|w| libc::pollfd {
            fd: w.fd,
            events: events_for(w.interest),
            revents: 0,
        }));

        // SAFETY: fds points at self.fds.len() initialized pollfd entries.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        trace!(watched = watched.len(), ready = rc, "poll returned");

        if self.fds[0].revents != 0 {
            trace!("poll woken");
            self.wake.drain();
        }
        for (w, pfd) in watched.iter().zip(&self.fds[1..]) {
            let r = pfd.revents;
            if r == 0 {
                continue;
            }
            ready.push((
                w.token,
                Readiness {
                    readable: r & (libc::POLLIN | libc::POLLPRI) != 0,
                    writable: r & libc::POLLOUT != 0,
                    hangup: r & libc::POLLHUP != 0,
                    error: r & (libc::POLLERR | libc::POLLNVAL) != 0,
                },
            ));
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wakeup> {
        self.wake.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_micros(300)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(250)), 250);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }

    #[test]
    fn test_events_for_interest() {
        assert_eq!(events_for(Interest::default()), 0);
        assert_ne!(
            events_for(Interest {
                read: true,
                write: false
            }) & libc::POLLIN,
            0
        );
        assert_eq!(
            events_for(Interest {
                read: false,
                write: true
            }),
            libc::POLLOUT
        );
    }
}

//! mio backend (epoll on Linux, kqueue on macOS).
//!
//! mio registrations are edge-triggered. To keep the loop's level-triggered
//! contract an fd is re-armed whenever it was reported in the previous pass:
//! re-arming makes the kernel re-evaluate it and re-report readiness the
//! handler left pending. Fds that stayed quiet keep their registration, and
//! any new edge on them is still queued by the kernel. So a pass costs one
//! `epoll_ctl` per active member instead of one per member. A fd is also
//! re-armed when its interest changes or when its number now belongs to a
//! different dispatcher (the kernel drops a registration on close).
//!
//! mio cannot register an fd with empty interest, so members that want
//! neither read nor write are not watched at all on this backend.

use super::{Interest, Poller, Readiness, Wakeup, Watch};
use crate::runtime::registry::Token;
use mio::unix::SourceFd;
use mio::{Events, Poll, Waker};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const EVENTS_CAPACITY: usize = 1024;

/// Slab keys never reach this.
const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Registration currently held by the kernel for one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    token: Token,
    id: u64,
    interest: Interest,
}

impl Wakeup for Waker {
    fn wake(&self) -> io::Result<()> {
        Waker::wake(self)
    }
}

pub(crate) struct MioPoller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    armed: HashMap<RawFd, Armed>,
    /// Tokens reported by the previous pass.
    reported: HashSet<Token>,
    /// Registrations issued so far.
    arms: usize,
}

impl MioPoller {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            armed: HashMap::new(),
            reported: HashSet::new(),
            arms: 0,
        })
    }

    fn arm(&mut self, w: &Watch, interest: mio::Interest) -> io::Result<()> {
        let fd = w.fd;
        let token = mio::Token(w.token.0);
        let registry = self.poll.registry();
        let source = &mut SourceFd(&fd);

        let result = if self.armed.contains_key(&fd) {
            registry.reregister(source, token, interest)
        } else {
            registry.register(source, token, interest)
        };

        match result {
            Ok(()) => {}
            // The old fd was closed and the number reused by a new handle.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                registry.register(source, token, interest)?
            }
            // Registered under this number by a handle we lost track of.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(source, token, interest)?
            }
            Err(e) => return Err(e),
        }

        self.arms += 1;
        self.armed.insert(
            fd,
            Armed {
                token: w.token,
                id: w.id,
                interest: w.interest,
            },
        );
        Ok(())
    }
}

fn to_mio(interest: Interest) -> Option<mio::Interest> {
    match (interest.read, interest.write) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Poller for MioPoller {
    fn poll(
        &mut self,
        watched: &[Watch],
        timeout: Duration,
        ready: &mut Vec<(Token, Readiness)>,
    ) -> io::Result<()> {
        let mut live = HashSet::with_capacity(watched.len());
        let mut rearmed = 0;
        for w in watched {
            if w.fd < 0 {
                continue;
            }
            let Some(interest) = to_mio(w.interest) else {
                continue;
            };
            live.insert(w.fd);

            let wanted = Armed {
                token: w.token,
                id: w.id,
                interest: w.interest,
            };
            let unchanged = self.armed.get(&w.fd) == Some(&wanted);
            if unchanged && !self.reported.contains(&w.token) {
                continue;
            }
            self.arm(w, interest)?;
            rearmed += 1;
        }
        self.reported.clear();

        // Drop registrations for members that left or lost interest. Errors
        // mean the fd is already closed, which removed it from the kernel set.
        let registry = self.poll.registry();
        self.armed.retain(|fd, _| {
            if live.contains(fd) {
                return true;
            }
            let _ = registry.deregister(&mut SourceFd(fd));
            false
        });

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                trace!("mio poll woken");
                continue;
            }
            self.reported.insert(Token(event.token().0));
            ready.push((
                Token(event.token().0),
                Readiness {
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable(),
                    hangup: event.is_read_closed() && event.is_write_closed(),
                    error: event.is_error(),
                },
            ));
        }
        trace!(
            watched = live.len(),
            rearmed,
            ready = ready.len(),
            "mio poll returned"
        );
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wakeup> {
        self.waker.clone()
    }
}

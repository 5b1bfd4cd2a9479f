//! Readiness multiplexing backends.
//!
//! Each iteration the event loop hands the poller the full watch list
//! (fd + read/write interest per member) and gets back the members that
//! became ready. Interest is recomputed every iteration, so both backends
//! behave level-triggered:
//! - `Poll`: `poll(2)` via libc, available on every unix.
//! - `Mio`: epoll on Linux, kqueue on macOS.
//!
//! Every poller also owns a wake source that is always watched, so another
//! thread can cut a wait short through [`Wakeup`].

mod sys_poll;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mio_impl;

use crate::runtime::registry::Token;
use serde::Deserialize;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Which OS primitive drives the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PollMechanism {
    /// `poll(2)`.
    #[default]
    Poll,
    /// mio (epoll/kqueue).
    Mio,
}

/// What a member wants to be woken for. Errors and hang-ups are always
/// reported when the backend can watch the fd at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

/// What the poller observed for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Both directions shut down.
    pub hangup: bool,
    /// Error condition pending on the descriptor.
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

/// One entry of the watch list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Watch {
    pub token: Token,
    /// Dispatcher identity, tells a reused fd number from the old one.
    pub id: u64,
    pub fd: RawFd,
    pub interest: Interest,
}

/// Interrupts a blocked [`Poller::poll`] from any thread.
///
/// A wake-up that arrives before the wait starts makes the next wait
/// return at once. It is never reported as readiness.
pub(crate) trait Wakeup: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

pub(crate) trait Poller {
    /// Wait up to `timeout` and append ready members to `ready`.
    ///
    /// A signal interrupting the wait is an empty result, not an error.
    fn poll(
        &mut self,
        watched: &[Watch],
        timeout: Duration,
        ready: &mut Vec<(Token, Readiness)>,
    ) -> io::Result<()>;

    /// The wake source this poller always watches.
    fn waker(&self) -> Arc<dyn Wakeup>;
}

pub(crate) fn new_poller(mechanism: PollMechanism) -> io::Result<Box<dyn Poller>> {
    match mechanism {
        PollMechanism::Poll => Ok(Box::new(sys_poll::SysPoll::new()?)),
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        PollMechanism::Mio => Ok(Box::new(mio_impl::MioPoller::new()?)),
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        PollMechanism::Mio => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the mio backend is only built on Linux and macOS",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn mechanisms() -> Vec<PollMechanism> {
        let mut all = vec![PollMechanism::Poll];
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            all.push(PollMechanism::Mio);
        }
        all
    }

    fn poll_for(
        poller: &mut dyn Poller,
        watched: &[Watch],
    ) -> Vec<(Token, Readiness)> {
        let mut ready = Vec::new();
        poller
            .poll(watched, Duration::from_millis(200), &mut ready)
            .unwrap();
        ready
    }

    #[test]
    fn test_read_and_write_readiness() {
        for mechanism in mechanisms() {
            let mut poller = new_poller(mechanism).unwrap();
            let (a, mut b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();

            let read_only = [Watch {
                token: Token(7),
                id: 7,
                fd: a.as_raw_fd(),
                interest: Interest {
                    read: true,
                    write: false,
                },
            }];

            // Nothing to read yet.
            let mut ready = Vec::new();
            poller
                .poll(&read_only, Duration::from_millis(10), &mut ready)
                .unwrap();
            assert!(ready.is_empty(), "{mechanism:?}: {ready:?}");

            b.write_all(b"x").unwrap();
            let ready = poll_for(poller.as_mut(), &read_only);
            assert_eq!(ready.len(), 1, "{mechanism:?}");
            assert_eq!(ready[0].0, Token(7));
            assert!(ready[0].1.readable);
            assert!(!ready[0].1.writable);

            // Unread data keeps reporting readable (level-triggered).
            let ready = poll_for(poller.as_mut(), &read_only);
            assert!(ready[0].1.readable, "{mechanism:?}");

            let both = [Watch {
                interest: Interest {
                    read: true,
                    write: true,
                },
                ..read_only[0]
            }];
            let ready = poll_for(poller.as_mut(), &both);
            assert!(ready[0].1.readable && ready[0].1.writable, "{mechanism:?}");
        }
    }

    #[test]
    fn test_peer_close_reports_readable() {
        for mechanism in mechanisms() {
            let mut poller = new_poller(mechanism).unwrap();
            let (a, b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            drop(b);

            let watched = [Watch {
                token: Token(1),
                id: 1,
                fd: a.as_raw_fd(),
                interest: Interest {
                    read: true,
                    write: false,
                },
            }];
            let ready = poll_for(poller.as_mut(), &watched);
            assert_eq!(ready.len(), 1, "{mechanism:?}");
            assert!(ready[0].1.readable || ready[0].1.hangup, "{mechanism:?}");
        }
    }

    #[test]
    fn test_empty_watch_list_times_out() {
        for mechanism in mechanisms() {
            let mut poller = new_poller(mechanism).unwrap();
            let mut ready = Vec::new();
            poller
                .poll(&[], Duration::from_millis(5), &mut ready)
                .unwrap();
            assert!(ready.is_empty());
        }
    }

    #[test]
    fn test_wakeup_cuts_the_wait_short() {
        for mechanism in mechanisms() {
            let mut poller = new_poller(mechanism).unwrap();
            let waker = poller.waker();
            let (a, _b) = UnixStream::pair().unwrap();
            let watched = [Watch {
                token: Token(0),
                id: 0,
                fd: a.as_raw_fd(),
                interest: Interest {
                    read: true,
                    write: false,
                },
            }];

            let waking = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                waker.wake().unwrap();
            });
            let started = Instant::now();
            let mut ready = Vec::new();
            poller
                .poll(&watched, Duration::from_secs(10), &mut ready)
                .unwrap();
            waking.join().unwrap();
            assert!(started.elapsed() < Duration::from_secs(5), "{mechanism:?}");
            assert!(ready.is_empty(), "{mechanism:?}: {ready:?}");

            // A wake-up before the wait is not lost, and is consumed once.
            poller.waker().wake().unwrap();
            poller.waker().wake().unwrap();
            let started = Instant::now();
            poller
                .poll(&watched, Duration::from_secs(10), &mut ready)
                .unwrap();
            assert!(started.elapsed() < Duration::from_secs(5), "{mechanism:?}");
            poller
                .poll(&watched, Duration::from_millis(10), &mut ready)
                .unwrap();
            assert!(ready.is_empty(), "{mechanism:?}");
        }
    }

    #[test]
    fn test_mechanism_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mechanism: PollMechanism,
        }
        let w: Wrapper = toml::from_str(r#"mechanism = "mio""#).unwrap();
        assert_eq!(w.mechanism, PollMechanism::Mio);
        assert_eq!(PollMechanism::default(), PollMechanism::Poll);
        assert!(Readiness::default().is_empty());
    }
}

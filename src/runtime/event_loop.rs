//! The event loop.
//!
//! Each iteration snapshots the registry, asks every member what it wants to
//! be woken for, waits on the configured readiness primitive, and dispatches
//! the results. A member closed earlier in the same pass is skipped, and any
//! readiness already collected for it is dropped.
//!
//! The loop ends when the registry empties, when the iteration budget runs
//! out, or with [`Error::Shutdown`] when a [`ShutdownHandle`] fires or a hook
//! asks for it. [`EventLoop::poll_once`] runs a single iteration for callers
//! embedding the loop in their own.

use crate::error::{Error, Result};
use crate::runtime::poller::{new_poller, PollMechanism, Poller, Readiness, Wakeup, Watch};
use crate::runtime::registry::{Registry, Token};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Default per-iteration wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Loop parameters, fixed for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopConfig {
    pub mechanism: PollMechanism,
    /// Longest an iteration waits with nothing ready.
    pub timeout: Duration,
    /// Stop after this many iterations.
    pub max_iterations: Option<usize>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            mechanism: PollMechanism::default(),
            timeout: DEFAULT_TIMEOUT,
            max_iterations: None,
        }
    }
}

impl EventLoopConfig {
    pub fn with_mechanism(mut self, mechanism: PollMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, count: usize) -> Self {
        self.max_iterations = Some(count);
        self
    }
}

#[derive(Default)]
struct ShutdownState {
    requested: AtomicBool,
    /// Wake sources of the loops stopped by this handle.
    wakers: Mutex<Vec<Weak<dyn Wakeup>>>,
}

/// Thread-safe trigger for stopping loops from outside.
///
/// One handle may stop several loops. Firing it sets the flag and wakes
/// every attached loop out of its wait, so it takes effect at once rather
/// than after the loop's timeout.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.state.requested.store(true, Ordering::Release);
        let wakers = self
            .state
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    fn attach(&self, waker: &Arc<dyn Wakeup>) {
        let mut wakers = self
            .state
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        wakers.retain(|w| w.strong_count() > 0);
        wakers.push(Arc::downgrade(waker));
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_shutdown())
            .finish()
    }
}

pub struct EventLoop {
    config: EventLoopConfig,
    registry: Registry,
    poller: Box<dyn Poller>,
    shutdown: ShutdownHandle,
    iterations: usize,
    watched: Vec<Watch>,
    ready: Vec<(Token, Readiness)>,
}

impl EventLoop {
    /// Loop over `registry` using the configured backend.
    pub fn new(config: EventLoopConfig, registry: Registry) -> io::Result<Self> {
        let poller = new_poller(config.mechanism)?;
        let shutdown = ShutdownHandle::new();
        shutdown.attach(&poller.waker());
        Ok(Self {
            config,
            registry,
            poller,
            shutdown,
            iterations: 0,
            watched: Vec::new(),
            ready: Vec::new(),
        })
    }

    /// Loop over the calling thread's default registry.
    pub fn on_thread_default(config: EventLoopConfig) -> io::Result<Self> {
        Self::new(config, Registry::thread_default())
    }

    /// Stop when `shutdown` fires instead of the loop's own handle.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        shutdown.attach(&self.poller.waker());
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Iterations completed so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Run until the registry is empty or the iteration budget is spent.
    ///
    /// Returns `Err(Error::Shutdown)` on shutdown and `Err(Error::Poll)` if
    /// the readiness primitive fails. Nothing else escapes.
    pub fn run(&mut self) -> Result<()> {
        debug!(
            mechanism = ?self.config.mechanism,
            timeout_ms = self.config.timeout.as_millis() as u64,
            max_iterations = ?self.config.max_iterations,
            members = self.registry.len(),
            "Event loop starting"
        );

        loop {
            if self.registry.is_empty() {
                debug!(iterations = self.iterations, "Registry empty, event loop done");
                return Ok(());
            }
            if let Some(max) = self.config.max_iterations {
                if self.iterations >= max {
                    debug!(iterations = self.iterations, "Iteration budget spent");
                    return Ok(());
                }
            }
            self.poll_once()?;
        }
    }

    /// Run one iteration. Returns the number of members dispatched.
    pub fn poll_once(&mut self) -> Result<usize> {
        self.check_shutdown()?;

        let members = self.registry.snapshot_active();
        self.watched.clear();
        for (token, handle) in &members {
            if let Some(watch) = handle.watch(*token) {
                self.watched.push(watch);
            }
        }

        self.ready.clear();
        if let Err(e) = self
            .poller
            .poll(&self.watched, self.config.timeout, &mut self.ready)
        {
            error!(error = %e, "Readiness poll failed");
            return Err(Error::Poll(e));
        }
        self.iterations += 1;
        self.check_shutdown()?;

        let mut dispatched = 0;
        for &(token, readiness) in &self.ready {
            let Ok(idx) = members.binary_search_by_key(&token, |(t, _)| *t) else {
                continue;
            };
            let handle = &members[idx].1;
            // Closed (or replaced) earlier in this pass.
            if !self.registry.holds(token, handle) {
                trace!(token = token.0, "Skipping departed member");
                continue;
            }
            dispatched += 1;
            handle.on_ready(readiness)?;
        }
        Ok(dispatched)
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            debug!(iterations = self.iterations, "Shutdown requested");
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

/// Build a loop over `registry` and run it.
pub fn run(config: EventLoopConfig, registry: Registry) -> Result<()> {
    EventLoop::new(config, registry).map_err(Error::Poll)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::descriptor::SocketDescriptor;
    use crate::runtime::dispatcher::{ConnState, Dispatcher, DispatcherHandle, Handler};
    use crate::runtime::file::{pipe, FileDescriptor};
    use socket2::Socket;
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Instant;

    fn fast() -> EventLoopConfig {
        EventLoopConfig::default().with_timeout(Duration::from_millis(50))
    }

    fn mechanisms() -> Vec<PollMechanism> {
        let mut all = vec![PollMechanism::Poll];
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            all.push(PollMechanism::Mio);
        }
        all
    }

    #[derive(Debug, Default)]
    struct Log {
        received: Vec<u8>,
        reads: usize,
        closes: usize,
        errors: usize,
        connects: usize,
    }

    struct Recorder(Rc<RefCell<Log>>);

    impl Handler for Recorder {
        fn handle_read(&mut self, d: &mut Dispatcher) -> crate::Result<()> {
            d.read_chunk()?;
            let mut log = self.0.borrow_mut();
            log.reads += 1;
            log.received.extend_from_slice(&d.take_incoming());
            Ok(())
        }

        fn handle_connect(&mut self, _d: &mut Dispatcher) -> crate::Result<()> {
            self.0.borrow_mut().connects += 1;
            Ok(())
        }

        fn handle_close(&mut self, _d: &mut Dispatcher) {
            self.0.borrow_mut().closes += 1;
        }

        fn handle_error(&mut self, d: &mut Dispatcher, _error: &Error) {
            self.0.borrow_mut().errors += 1;
            d.close();
        }
    }

    /// Listener that registers each accepted connection under a `Recorder`.
    struct Accepting {
        accepted: Rc<RefCell<Vec<(DispatcherHandle, Rc<RefCell<Log>>)>>>,
    }

    impl Handler for Accepting {
        fn handle_accepted(
            &mut self,
            d: &mut Dispatcher,
            socket: SocketDescriptor,
            _peer: SocketAddr,
        ) -> crate::Result<()> {
            let log = Rc::new(RefCell::new(Log::default()));
            let registry = d.registry().ok_or(Error::Closed)?;
            let handle =
                Dispatcher::connected(socket, &registry).register(Recorder(Rc::clone(&log)))?;
            self.accepted.borrow_mut().push((handle, log));
            Ok(())
        }
    }

    fn listener(
        registry: &Registry,
    ) -> (
        DispatcherHandle,
        SocketAddr,
        Rc<RefCell<Vec<(DispatcherHandle, Rc<RefCell<Log>>)>>>,
    ) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut d = Dispatcher::with_registry(SocketDescriptor::for_addr(&addr).unwrap(), registry);
        d.set_reuse_addr().unwrap();
        d.bind(addr).unwrap();
        d.listen(16).unwrap();
        let bound = d.local_addr().unwrap();
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let handle = d
            .register(Accepting {
                accepted: Rc::clone(&accepted),
            })
            .unwrap();
        (handle, bound, accepted)
    }

    fn unix_member(registry: &Registry) -> (DispatcherHandle, UnixStream, Rc<RefCell<Log>>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let desc = SocketDescriptor::from_socket(Socket::from(ours)).unwrap();
        let log = Rc::new(RefCell::new(Log::default()));
        let handle = Dispatcher::connected(desc, registry)
            .register(Recorder(Rc::clone(&log)))
            .unwrap();
        (handle, theirs, log)
    }

    fn spin_until(event_loop: &mut EventLoop, mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            event_loop.poll_once().unwrap();
        }
        panic!("condition not reached within 100 iterations");
    }

    #[test]
    fn test_ping_pong_scenario() {
        for mechanism in mechanisms() {
            let registry = Registry::new();
            let (_listener, addr, accepted) = listener(&registry);
            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry.clone()).unwrap();

            let mut client = TcpStream::connect(addr).unwrap();
            spin_until(&mut event_loop, || accepted.borrow().len() == 1);
            assert_eq!(registry.len(), 2);

            client.write_all(b"PING").unwrap();
            let (conn, log) = accepted.borrow()[0].clone();
            spin_until(&mut event_loop, || log.borrow().received.len() >= 4);
            assert_eq!(log.borrow().received, b"PING");

            conn.write_data(b"PONG").unwrap();
            spin_until(&mut event_loop, || conn.with(|d| d.outgoing_len()).unwrap() == 0);

            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(&reply, b"PONG");

            // Nothing else follows.
            client.set_nonblocking(true).unwrap();
            let mut extra = [0u8; 8];
            let err = client.read(&mut extra).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock, "{mechanism:?}");
        }
    }

    #[test]
    fn test_eof_closes_in_the_same_iteration() {
        for mechanism in mechanisms() {
            let registry = Registry::new();
            let (conn, peer, log) = unix_member(&registry);
            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry.clone()).unwrap();

            drop(peer);
            let dispatched = event_loop.poll_once().unwrap();
            assert_eq!(dispatched, 1, "{mechanism:?}");
            assert_eq!(conn.state(), ConnState::Closed, "{mechanism:?}");
            assert_eq!(log.borrow().closes, 1);
            assert_eq!(log.borrow().errors, 0);
            assert!(registry.is_empty());

            // Empty registry ends the loop.
            event_loop.run().unwrap();
            assert_eq!(event_loop.iterations(), 1);
        }
    }

    #[test]
    fn test_ordered_delivery_across_writes() {
        let registry = Registry::new();
        let (conn, mut peer, _log) = unix_member(&registry);
        let mut event_loop = EventLoop::new(fast(), registry).unwrap();

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; 1 + (i as usize * 37) % 500];
            conn.write_data(&chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }
        spin_until(&mut event_loop, || conn.with(|d| d.outgoing_len()).unwrap() == 0);

        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_idle_connected_member_is_not_write_dispatched() {
        let registry = Registry::new();
        let (_conn, _peer, log) = unix_member(&registry);
        let mut event_loop = EventLoop::new(
            EventLoopConfig::default().with_timeout(Duration::from_millis(5)),
            registry,
        )
        .unwrap();

        for _ in 0..5 {
            assert_eq!(event_loop.poll_once().unwrap(), 0);
        }
        assert_eq!(log.borrow().reads, 0);
    }

    #[test]
    fn test_member_closed_mid_iteration_is_skipped() {
        /// Closes the other member from its own read hook.
        struct CloseOther {
            other: Rc<RefCell<Option<DispatcherHandle>>>,
            reads: Rc<RefCell<usize>>,
        }
        impl Handler for CloseOther {
            fn handle_read(&mut self, d: &mut Dispatcher) -> crate::Result<()> {
                d.read_chunk()?;
                *self.reads.borrow_mut() += 1;
                if let Some(other) = self.other.borrow_mut().take() {
                    other.close()?;
                }
                Ok(())
            }
        }

        for mechanism in mechanisms() {
            let registry = Registry::new();
            let reads = Rc::new(RefCell::new(0));
            let mut peers = Vec::new();
            let mut members = Vec::new();
            for _ in 0..2 {
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                theirs.write_all(b"x").unwrap();
                peers.push(theirs);
                let other = Rc::new(RefCell::new(None));
                let handle = Dispatcher::connected(
                    SocketDescriptor::from_socket(Socket::from(ours)).unwrap(),
                    &registry,
                )
                .register(CloseOther {
                    other: Rc::clone(&other),
                    reads: Rc::clone(&reads),
                })
                .unwrap();
                members.push((handle, other));
            }
            *members[0].1.borrow_mut() = Some(members[1].0.clone());
            *members[1].1.borrow_mut() = Some(members[0].0.clone());

            // Both are ready; whichever runs first closes the other, whose
            // collected readiness must then be dropped.
            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry.clone()).unwrap();
            let dispatched = event_loop.poll_once().unwrap();

            assert_eq!(dispatched, 1, "{mechanism:?}");
            assert_eq!(*reads.borrow(), 1, "{mechanism:?}");
            let closed = members.iter().filter(|(h, _)| h.is_closed()).count();
            assert_eq!(closed, 1, "{mechanism:?}");
            assert_eq!(registry.len(), 1);
            for (_, other) in &members {
                other.borrow_mut().take();
            }
        }
    }

    #[test]
    fn test_faulting_handler_does_not_stop_the_loop() {
        struct Faulty(Rc<RefCell<usize>>);
        impl Handler for Faulty {
            fn handle_read(&mut self, _d: &mut Dispatcher) -> crate::Result<()> {
                Err(Error::handler("cannot parse"))
            }
            fn handle_error(&mut self, d: &mut Dispatcher, _error: &Error) {
                *self.0.borrow_mut() += 1;
                d.close();
            }
        }

        for mechanism in mechanisms() {
            let registry = Registry::new();
            let (a, mut a_peer) = UnixStream::pair().unwrap();
            let faults = Rc::new(RefCell::new(0));
            let faulty = Dispatcher::connected(
                SocketDescriptor::from_socket(Socket::from(a)).unwrap(),
                &registry,
            )
            .register(Faulty(Rc::clone(&faults)))
            .unwrap();
            let (_healthy, mut b_peer, log) = unix_member(&registry);

            a_peer.write_all(b"garbage").unwrap();
            b_peer.write_all(b"fine").unwrap();

            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry).unwrap();
            event_loop.poll_once().unwrap();

            assert_eq!(*faults.borrow(), 1, "{mechanism:?}");
            assert!(faulty.is_closed());
            assert_eq!(log.borrow().received, b"fine", "{mechanism:?}");
        }
    }

    #[test]
    fn test_shutdown_handle_stops_run() {
        for mechanism in mechanisms() {
            let registry = Registry::new();
            let (_conn, _peer, _log) = unix_member(&registry);
            // Default 30 s timeout: only the wake-up can end the wait early.
            let mut event_loop = EventLoop::new(
                EventLoopConfig::default().with_mechanism(mechanism),
                registry,
            )
            .unwrap();
            let shutdown = event_loop.shutdown_handle();

            let trigger = shutdown.clone();
            let stopper = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                trigger.shutdown();
            });

            let started = Instant::now();
            assert!(matches!(event_loop.run(), Err(Error::Shutdown)));
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "{mechanism:?}: shutdown took {:?}",
                started.elapsed()
            );
            stopper.join().unwrap();
            assert!(shutdown.is_shutdown());
        }
    }

    #[test]
    fn test_one_handle_stops_loops_on_several_threads() {
        let shutdown = ShutdownHandle::new();
        let loops: Vec<_> = mechanisms()
            .into_iter()
            .map(|mechanism| {
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    let registry = Registry::new();
                    let (_conn, _peer, _log) = unix_member(&registry);
                    let mut event_loop = EventLoop::new(
                        EventLoopConfig::default().with_mechanism(mechanism),
                        registry,
                    )
                    .unwrap()
                    .with_shutdown(shutdown);
                    let started = Instant::now();
                    let result = event_loop.run();
                    (matches!(result, Err(Error::Shutdown)), started.elapsed())
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        shutdown.shutdown();
        for handle in loops {
            let (stopped, took) = handle.join().unwrap();
            assert!(stopped);
            assert!(took < Duration::from_secs(5), "took {took:?}");
        }
    }

    #[test]
    fn test_iteration_budget() {
        let registry = Registry::new();
        let (_conn, _peer, _log) = unix_member(&registry);
        let mut event_loop = EventLoop::new(
            EventLoopConfig::default()
                .with_timeout(Duration::from_millis(1))
                .with_max_iterations(3),
            registry,
        )
        .unwrap();

        event_loop.run().unwrap();
        assert_eq!(event_loop.iterations(), 3);
    }

    #[test]
    fn test_members_left_after_budget_close_with_the_registry() {
        let registry = Registry::new();
        let (conn, mut peer, log) = unix_member(&registry);
        let mut event_loop = EventLoop::new(
            EventLoopConfig::default()
                .with_timeout(Duration::from_millis(1))
                .with_max_iterations(1),
            registry.clone(),
        )
        .unwrap();
        event_loop.run().unwrap();
        assert!(!conn.is_closed());

        drop(event_loop);
        drop(registry);
        assert!(conn.is_closed());
        assert_eq!(log.borrow().closes, 1);

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_outbound_connect() {
        for mechanism in mechanisms() {
            let server = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = server.local_addr().unwrap();

            let registry = Registry::new();
            let mut d = Dispatcher::with_registry(SocketDescriptor::for_addr(&addr).unwrap(), &registry);
            d.connect(addr).unwrap();
            assert_eq!(d.state(), ConnState::Connecting);
            d.write_data(b"hello").unwrap();

            let log = Rc::new(RefCell::new(Log::default()));
            let conn = d.register(Recorder(Rc::clone(&log))).unwrap();
            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry).unwrap();

            spin_until(&mut event_loop, || conn.with(|d| d.outgoing_len()).unwrap() == 0);
            assert_eq!(conn.state(), ConnState::Connected);
            assert_eq!(log.borrow().connects, 1);

            let (mut accepted, _) = server.accept().unwrap();
            let mut got = [0u8; 5];
            accepted.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"hello");
        }
    }

    #[test]
    fn test_refused_connect_reports_error_then_closes() {
        let addr = {
            let unused = TcpListener::bind("127.0.0.1:0").unwrap();
            unused.local_addr().unwrap()
        };

        for mechanism in mechanisms() {
            let registry = Registry::new();
            let mut d =
                Dispatcher::with_registry(SocketDescriptor::for_addr(&addr).unwrap(), &registry);
            let log = Rc::new(RefCell::new(Log::default()));
            match d.connect(addr) {
                Ok(()) => {
                    let conn = d.register(Recorder(Rc::clone(&log))).unwrap();
                    let mut event_loop =
                        EventLoop::new(fast().with_mechanism(mechanism), registry.clone())
                            .unwrap();
                    spin_until(&mut event_loop, || conn.is_closed());
                    assert_eq!(log.borrow().errors, 1, "{mechanism:?}");
                    assert_eq!(log.borrow().closes, 1, "{mechanism:?}");
                    assert_eq!(log.borrow().connects, 0, "{mechanism:?}");
                    assert!(registry.is_empty());
                }
                // Some platforms refuse loopback connects synchronously.
                Err(e) => assert!(matches!(e, Error::Connection(_))),
            }
        }
    }

    #[test]
    fn test_pipe_descriptor_in_loop() {
        for mechanism in mechanisms() {
            let registry = Registry::new();
            let (rx, tx) = pipe().unwrap();
            let log = Rc::new(RefCell::new(Log::default()));
            let reader = Dispatcher::connected(FileDescriptor::new(rx).unwrap(), &registry)
                .register(Recorder(Rc::clone(&log)))
                .unwrap();
            let writer = Dispatcher::connected(FileDescriptor::new(tx).unwrap(), &registry)
                .register(Recorder(Rc::new(RefCell::new(Log::default()))))
                .unwrap();

            writer.write_data(b"through the pipe").unwrap();
            let mut event_loop =
                EventLoop::new(fast().with_mechanism(mechanism), registry.clone()).unwrap();
            spin_until(&mut event_loop, || log.borrow().received.len() == 16);
            assert_eq!(log.borrow().received, b"through the pipe", "{mechanism:?}");

            writer.close().unwrap();
            spin_until(&mut event_loop, || reader.is_closed());
            assert_eq!(log.borrow().closes, 1, "{mechanism:?}");
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn test_registries_on_separate_threads_are_isolated() {
        fn serve_one(tag: u8) -> (usize, Vec<u8>) {
            let registry = Registry::new();
            let (listener, addr, accepted) = listener(&registry);
            let mut event_loop = EventLoop::new(fast(), registry.clone()).unwrap();

            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(&[tag; 3]).unwrap();
            spin_until(&mut event_loop, || {
                accepted
                    .borrow()
                    .first()
                    .map_or(false, |(_, log)| log.borrow().received.len() == 3)
            });

            let members = registry.len();
            let received = accepted.borrow()[0].1.borrow().received.clone();
            listener.close().unwrap();
            registry.close_all();
            event_loop.run().unwrap();
            (members, received)
        }

        let a = std::thread::spawn(|| serve_one(b'a'));
        let b = std::thread::spawn(|| serve_one(b'b'));
        let (a_members, a_received) = a.join().unwrap();
        let (b_members, b_received) = b.join().unwrap();

        assert_eq!(a_members, 2);
        assert_eq!(b_members, 2);
        assert_eq!(a_received, b"aaa");
        assert_eq!(b_received, b"bbb");
    }

    #[test]
    fn test_run_convenience_on_thread_default() {
        let registry = Registry::thread_default();
        let (_conn, peer, log) = unix_member(&registry);
        drop(peer);
        run(fast(), registry.clone()).unwrap();
        assert_eq!(log.borrow().closes, 1);
        assert!(EventLoop::on_thread_default(fast())
            .unwrap()
            .registry()
            .same_as(&registry));
    }
}

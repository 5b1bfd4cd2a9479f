//! Dispatchers: one descriptor, its connection state, and its buffers.
//!
//! A [`Dispatcher`] holds the mechanics (descriptor, state machine, incoming
//! and outgoing queues). Application behavior lives in a [`Handler`], whose
//! hooks receive the dispatcher by `&mut`. The handler's default methods are
//! the reusable buffered-write bundle: watch for reads always, watch for
//! writes only while connecting or while output is queued, read into the
//! incoming buffer, and drain the outgoing buffer.
//!
//! Once registered, the pair lives behind a [`DispatcherHandle`].

use crate::error::{Error, Result};
use crate::runtime::buffer::{IncomingBuffer, OutgoingBuffer};
use crate::runtime::descriptor::{is_disconnect, Descriptor, IoOutcome, SocketDescriptor};
use crate::runtime::poller::{Interest, Readiness, Watch};
use crate::runtime::registry::{Registry, Token, WeakRegistry};
use bytes::BytesMut;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

/// Bytes requested per read.
pub const READ_CHUNK: usize = 8192;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Connection state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Fresh socket, or a listener.
    Unconnected,
    /// Non-blocking connect in flight.
    Connecting,
    Connected,
    /// Inside `close`, descriptor being released.
    Closing,
    /// Terminal. Never re-registered.
    Closed,
}

pub struct Dispatcher {
    id: u64,
    token: Option<Token>,
    /// Does not keep the registry alive.
    registry: WeakRegistry,
    descriptor: Option<Box<dyn Descriptor>>,
    state: ConnState,
    accepting: bool,
    incoming: IncomingBuffer,
    outgoing: OutgoingBuffer,
    /// Closed, and `handle_close` not yet delivered.
    close_pending: bool,
}

impl Dispatcher {
    /// Unconnected dispatcher bound to the thread's default registry.
    pub fn new(descriptor: impl Descriptor + 'static) -> Self {
        Self::with_registry(descriptor, &Registry::thread_default())
    }

    /// Unconnected dispatcher bound to `registry`.
    pub fn with_registry(descriptor: impl Descriptor + 'static, registry: &Registry) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            token: None,
            registry: registry.downgrade(),
            descriptor: Some(Box::new(descriptor)),
            state: ConnState::Unconnected,
            accepting: false,
            incoming: IncomingBuffer::new(),
            outgoing: OutgoingBuffer::new(),
            close_pending: false,
        }
    }

    /// Dispatcher for an already-connected descriptor: an accepted socket,
    /// a pipe, a tty.
    pub fn connected(descriptor: impl Descriptor + 'static, registry: &Registry) -> Self {
        let mut d = Self::with_registry(descriptor, registry);
        d.state = ConnState::Connected;
        d
    }

    /// Dispatcher for a socket that is already listening.
    pub fn listening(socket: SocketDescriptor, registry: &Registry) -> Self {
        let mut d = Self::with_registry(socket, registry);
        d.accepting = true;
        d
    }

    /// Register with this dispatcher's registry under `handler`.
    ///
    /// Fails with [`Error::Closed`] if that registry has been dropped.
    pub fn register<H: Handler>(self, handler: H) -> Result<DispatcherHandle> {
        let registry = self.registry().ok_or(Error::Closed)?;
        registry.register(self, handler)
    }

    pub(crate) fn attach(&mut self, registry: WeakRegistry, token: Token) {
        self.registry = registry;
        self.token = Some(token);
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// The registry this dispatcher belongs to, `None` once it is gone.
    pub fn registry(&self) -> Option<Registry> {
        self.registry.upgrade()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Raw handle, `None` once closed.
    pub fn fd(&self) -> Option<RawFd> {
        self.descriptor.as_ref().map(|d| d.raw_fd())
    }

    fn socket(&self, op: &'static str) -> Result<&SocketDescriptor> {
        match &self.descriptor {
            None => Err(Error::Closed),
            Some(desc) => desc.as_socket().ok_or(Error::Unsupported(op)),
        }
    }

    pub fn set_reuse_addr(&self) -> Result<()> {
        self.socket("set_reuse_addr")?.set_reuse_addr()?;
        Ok(())
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        self.socket("bind")?.bind(&addr)?;
        Ok(())
    }

    /// Start listening. The loop will call `handle_accept` on read-readiness.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.socket("listen")?.listen(backlog)?;
        self.accepting = true;
        Ok(())
    }

    /// Start a non-blocking connect. Completion is signalled later by
    /// write-readiness and `handle_connect`.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        match self.socket("connect")?.connect(&addr) {
            IoOutcome::Ready(()) | IoOutcome::WouldBlock => {
                self.state = ConnState::Connecting;
                debug!(token = ?self.token, addr = %addr, "Connecting");
                Ok(())
            }
            IoOutcome::Error(e) => Err(Error::Connection(e)),
        }
    }

    /// Accept one pending connection, `None` if there is nothing to accept.
    pub fn accept(&mut self) -> Result<Option<(SocketDescriptor, SocketAddr)>> {
        match self.socket("accept")?.accept() {
            IoOutcome::Ready(pair) => Ok(Some(pair)),
            IoOutcome::WouldBlock => Ok(None),
            // The client gave up between readiness and accept.
            IoOutcome::Error(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => Ok(None),
            IoOutcome::Error(e) => Err(Error::Connection(e)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket("local_addr")?.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket("peer_addr")?.peer_addr()?)
    }

    /// Queue bytes for transmission. Never performs I/O.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Err(Error::Closed);
        }
        self.outgoing.push(data)
    }

    /// Set or clear the outgoing high-water mark.
    pub fn set_high_water(&mut self, limit: Option<usize>) {
        self.outgoing.set_high_water(limit);
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming(&self) -> &[u8] {
        self.incoming.as_slice()
    }

    pub fn consume_incoming(&mut self, n: usize) {
        self.incoming.consume(n);
    }

    pub fn take_incoming(&mut self) -> BytesMut {
        self.incoming.take()
    }

    pub fn default_readable(&self) -> bool {
        true
    }

    /// Write interest only while a connect is pending or output is queued.
    /// A connected socket is almost always writable, so watching it with an
    /// empty queue would spin the loop.
    pub fn default_writable(&self) -> bool {
        match self.state {
            ConnState::Connecting => true,
            ConnState::Connected => !self.outgoing.is_empty(),
            _ => false,
        }
    }

    /// Read up to [`READ_CHUNK`] bytes into the incoming buffer.
    ///
    /// Returns the number of bytes appended. Zero means nothing was
    /// available, or the peer closed, in which case the dispatcher is now
    /// closed and `handle_close` follows as soon as the current hook returns.
    pub fn read_chunk(&mut self) -> Result<usize> {
        let Some(desc) = self.descriptor.as_deref_mut() else {
            return Err(Error::Closed);
        };
        match self.incoming.fill_from(desc, READ_CHUNK) {
            IoOutcome::Ready(0) => {
                self.peer_closed();
                Ok(0)
            }
            IoOutcome::Ready(n) => {
                trace!(token = ?self.token, n, "read");
                Ok(n)
            }
            IoOutcome::WouldBlock => Ok(0),
            IoOutcome::Error(e) if is_disconnect(&e) => {
                self.peer_closed();
                Ok(0)
            }
            IoOutcome::Error(e) => Err(Error::Connection(e)),
        }
    }

    /// One non-blocking send of the queued output.
    ///
    /// Returns bytes transmitted. The untransmitted suffix stays queued.
    pub fn flush(&mut self) -> Result<usize> {
        let Some(desc) = self.descriptor.as_deref_mut() else {
            return Err(Error::Closed);
        };
        match self.outgoing.drain_into(desc) {
            IoOutcome::Ready(n) => {
                trace!(token = ?self.token, n, remaining = self.outgoing.len(), "sent");
                Ok(n)
            }
            IoOutcome::WouldBlock => Ok(0),
            IoOutcome::Error(e) if is_disconnect(&e) => {
                self.peer_closed();
                Ok(0)
            }
            IoOutcome::Error(e) => Err(Error::Connection(e)),
        }
    }

    fn peer_closed(&mut self) {
        debug!(token = ?self.token, "Peer closed");
        self.state = ConnState::Closing;
        self.close();
    }

    /// Resolve a pending connect using the socket's `SO_ERROR`.
    pub(crate) fn finish_connect(&mut self) -> Result<()> {
        if let Some(sock) = self.descriptor.as_ref().and_then(|d| d.as_socket()) {
            if let Some(err) = sock.take_error()? {
                return Err(Error::Connection(err));
            }
        }
        self.state = ConnState::Connected;
        debug!(token = ?self.token, "Connected");
        Ok(())
    }

    /// Error reported by the poller for this descriptor.
    pub(crate) fn pending_error(&self) -> io::Error {
        self.descriptor
            .as_ref()
            .and_then(|d| d.as_socket())
            .and_then(|sock| sock.take_error().ok().flatten())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "descriptor error condition"))
    }

    /// Release the descriptor and leave the registry. Idempotent.
    ///
    /// Unsent output is discarded; received but unconsumed input is kept
    /// for `handle_close` to inspect.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;

        if let Some(desc) = self.descriptor.take() {
            let fd = desc.raw_fd();
            if let Err(e) = desc.close() {
                debug!(token = ?self.token, fd, error = %e, "Error releasing descriptor");
            }
        }
        if let (Some(token), Some(registry)) = (self.token, self.registry.upgrade()) {
            registry.release(token, self.id);
        }
        self.outgoing.clear();
        self.state = ConnState::Closed;
        self.close_pending = true;
        debug!(token = ?self.token, "Dispatcher closed");
    }

    pub(crate) fn take_close_notification(&mut self) -> bool {
        std::mem::take(&mut self.close_pending)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("token", &self.token)
            .field("state", &self.state)
            .field("accepting", &self.accepting)
            .field("fd", &self.fd())
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

/// Application hooks. Every method has a working default.
///
/// Hooks run to completion on the loop thread and must not block. Returning
/// an error routes it to [`handle_error`](Handler::handle_error), except
/// [`Error::Shutdown`], which stops the loop, and [`Error::PeerClosed`],
/// which closes the dispatcher without a report.
pub trait Handler: 'static {
    /// Whether the loop should watch for read-readiness.
    fn readable(&self, d: &Dispatcher) -> bool {
        d.default_readable()
    }

    /// Whether the loop should watch for write-readiness.
    fn writable(&self, d: &Dispatcher) -> bool {
        d.default_writable()
    }

    fn handle_read(&mut self, d: &mut Dispatcher) -> Result<()> {
        d.read_chunk().map(drop)
    }

    fn handle_write(&mut self, d: &mut Dispatcher) -> Result<()> {
        d.flush().map(drop)
    }

    /// A listening dispatcher is readable.
    fn handle_accept(&mut self, d: &mut Dispatcher) -> Result<()> {
        match d.accept()? {
            Some((socket, peer)) => self.handle_accepted(d, socket, peer),
            None => Ok(()),
        }
    }

    /// Wrap and register an accepted connection.
    fn handle_accepted(
        &mut self,
        d: &mut Dispatcher,
        socket: SocketDescriptor,
        peer: SocketAddr,
    ) -> Result<()> {
        warn!(token = ?d.token(), peer = %peer, "Unhandled accepted connection, dropping");
        drop(socket);
        Ok(())
    }

    /// A pending connect completed. Called once.
    fn handle_connect(&mut self, d: &mut Dispatcher) -> Result<()> {
        trace!(token = ?d.token(), "Unhandled connect event");
        Ok(())
    }

    /// The dispatcher is closed: descriptor released, registry left.
    /// Called exactly once.
    fn handle_close(&mut self, _d: &mut Dispatcher) {}

    /// A hook failed. The default logs and closes the dispatcher.
    fn handle_error(&mut self, d: &mut Dispatcher, error: &Error) {
        warn!(token = ?d.token(), error = %error, "Dispatcher error, closing");
        d.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Read,
    Write,
    Accept,
    Connect,
}

struct Channel {
    dispatcher: Dispatcher,
    handler: Box<dyn Handler>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl Channel {
    fn run_hook(&mut self, hook: Hook) -> Result<()> {
        let Channel {
            dispatcher,
            handler,
        } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match hook {
            Hook::Read => handler.handle_read(dispatcher),
            Hook::Write => handler.handle_write(dispatcher),
            Hook::Accept => handler.handle_accept(dispatcher),
            Hook::Connect => match dispatcher.finish_connect() {
                Ok(()) => handler.handle_connect(dispatcher),
                Err(e) => Err(e),
            },
        }));
        let result = outcome.unwrap_or_else(|payload| Err(Error::Handler(panic_message(&*payload))));

        match result {
            Ok(()) => {}
            Err(Error::Shutdown) => {
                self.settle();
                return Err(Error::Shutdown);
            }
            // Orderly end of stream, no error report.
            Err(Error::PeerClosed) => self.dispatcher.close(),
            // OS-level failures always end the dispatcher.
            Err(err @ Error::Connection(_)) => self.fail(err),
            Err(err) => self.report(&err),
        }
        self.settle();
        Ok(())
    }

    fn report(&mut self, err: &Error) {
        let Channel {
            dispatcher,
            handler,
        } = self;
        trace!(token = ?dispatcher.token(), error = %err, "Routing error to handle_error");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_error(dispatcher, err)));
        if let Err(payload) = outcome {
            error!(
                token = ?dispatcher.token(),
                error = %panic_message(&*payload),
                "handle_error failed, closing"
            );
            dispatcher.close();
        }
    }

    /// `handle_error`, then close (and `handle_close`) regardless of what
    /// the handler did.
    fn fail(&mut self, err: Error) {
        self.report(&err);
        self.dispatcher.close();
        self.settle();
    }

    /// Deliver a pending `handle_close`.
    fn settle(&mut self) {
        if !self.dispatcher.take_close_notification() {
            return;
        }
        let Channel {
            dispatcher,
            handler,
        } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_close(dispatcher)));
        if let Err(payload) = outcome {
            error!(
                token = ?dispatcher.token(),
                error = %panic_message(&*payload),
                "handle_close failed"
            );
        }
    }

    /// Dispatch one readiness report: read side, then write side, then
    /// error/hang-up. Stops as soon as the dispatcher is closed.
    fn on_ready(&mut self, ready: Readiness) -> Result<()> {
        if ready.readable && !self.dispatcher.is_closed() {
            let hook = if self.dispatcher.is_accepting() {
                Hook::Accept
            } else if self.dispatcher.state() == ConnState::Connecting {
                Hook::Connect
            } else {
                Hook::Read
            };
            self.run_hook(hook)?;
        }

        if ready.writable && !self.dispatcher.is_closed() && !self.dispatcher.is_accepting() {
            let hook = if self.dispatcher.state() == ConnState::Connecting {
                Hook::Connect
            } else {
                Hook::Write
            };
            self.run_hook(hook)?;
        }

        if self.dispatcher.is_closed() {
            return Ok(());
        }
        if ready.error {
            let err = self.dispatcher.pending_error();
            self.fail(Error::Connection(err));
        } else if ready.hangup && !ready.readable {
            debug!(token = ?self.dispatcher.token(), "Hang-up");
            self.dispatcher.close();
            self.settle();
        }
        Ok(())
    }
}

/// Shared handle to a registered dispatcher and its handler.
///
/// Handles are cheap to clone and are how code outside a hook (or a hook of
/// another dispatcher) reaches a dispatcher. While one of the dispatcher's
/// own hooks is running, [`with`](Self::with), [`write_data`](Self::write_data)
/// and [`close`](Self::close) return [`Error::Busy`]; inside a hook, use the
/// `&mut Dispatcher` the hook received.
#[derive(Clone)]
pub struct DispatcherHandle {
    token: Option<Token>,
    channel: Rc<RefCell<Channel>>,
}

impl DispatcherHandle {
    pub(crate) fn new(dispatcher: Dispatcher, handler: Box<dyn Handler>) -> Self {
        Self {
            token: dispatcher.token(),
            channel: Rc::new(RefCell::new(Channel {
                dispatcher,
                handler,
            })),
        }
    }

    pub fn ptr_eq(&self, other: &DispatcherHandle) -> bool {
        Rc::ptr_eq(&self.channel, &other.channel)
    }

    /// Token assigned at registration. Kept after close.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn state(&self) -> ConnState {
        self.channel.borrow().dispatcher.state()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.borrow().dispatcher.is_closed()
    }

    /// Run `f` against the dispatcher. A close performed by `f` delivers
    /// `handle_close` before this returns.
    pub fn with<R>(&self, f: impl FnOnce(&mut Dispatcher) -> R) -> Result<R> {
        let Ok(mut channel) = self.channel.try_borrow_mut() else {
            return Err(Error::Busy);
        };
        let result = f(&mut channel.dispatcher);
        channel.settle();
        Ok(result)
    }

    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        self.with(|d| d.write_data(data))?
    }

    /// Close the dispatcher. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.with(Dispatcher::close)
    }

    /// Watch-list entry for this iteration, `None` once closed.
    pub(crate) fn watch(&self, token: Token) -> Option<Watch> {
        let channel = self.channel.borrow();
        let d = &channel.dispatcher;
        if d.is_closed() {
            return None;
        }
        Some(Watch {
            token,
            id: d.id(),
            fd: d.fd()?,
            interest: Interest {
                read: channel.handler.readable(d),
                write: channel.handler.writable(d),
            },
        })
    }

    pub(crate) fn on_ready(&self, ready: Readiness) -> Result<()> {
        self.channel.borrow_mut().on_ready(ready)
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel.try_borrow() {
            Ok(channel) => channel.dispatcher.fmt(f),
            Err(_) => f.write_str("DispatcherHandle(<in use>)"),
        }
    }
}

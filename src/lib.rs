//! dispatch-loop: a single-threaded readiness event loop
//!
//! Connections are wrapped in [`Dispatcher`]s, given application behavior
//! through a [`Handler`], and registered in a per-thread [`Registry`]. An
//! [`EventLoop`] waits on every registered descriptor at once and calls the
//! handler hooks as descriptors become ready. All I/O is non-blocking and
//! buffered; nothing in the loop ever blocks except the wait itself.
//!
//! ```no_run
//! use dispatch_loop::{Dispatcher, EventLoop, EventLoopConfig, Handler, Registry, SocketDescriptor};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn handle_connect(&mut self, d: &mut Dispatcher) -> dispatch_loop::Result<()> {
//!         d.write_data(b"hello\r\n")
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let addr = "127.0.0.1:7878".parse()?;
//! let registry = Registry::new();
//! let mut d = Dispatcher::with_registry(SocketDescriptor::for_addr(&addr)?, &registry);
//! d.connect(addr)?;
//! d.register(Hello)?;
//! EventLoop::new(EventLoopConfig::default(), registry)?.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! Two readiness backends are available: `poll(2)` everywhere and mio
//! (epoll/kqueue) on Linux and macOS. See [`PollMechanism`].
//!
//! The `protocols`, `config`, and `server` modules build a multi-worker demo
//! server on top of the runtime.

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
pub use runtime::{
    run, ConnState, Descriptor, Dispatcher, DispatcherHandle, EventLoop, EventLoopConfig,
    FileDescriptor, Handler, IoOutcome, PollMechanism, Registry, ShutdownHandle,
    SocketDescriptor, Token,
};

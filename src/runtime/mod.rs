//! Single-threaded readiness runtime.
//!
//! - `descriptor`: non-blocking byte endpoints (sockets, raw fds)
//! - `buffer`: per-connection input and output buffers
//! - `dispatcher`: connection state, buffered I/O, and the `Handler` hooks
//! - `registry`: per-thread set of live dispatchers
//! - `poller`: `poll(2)` and mio readiness backends
//! - `event_loop`: waits on the registry and dispatches readiness

mod buffer;
mod descriptor;
mod dispatcher;
mod event_loop;
mod file;
mod poller;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{IncomingBuffer, OutgoingBuffer};
pub use descriptor::{is_disconnect, Descriptor, IoOutcome, SocketDescriptor};
pub use dispatcher::{ConnState, Dispatcher, DispatcherHandle, Handler, READ_CHUNK};
pub use event_loop::{run, EventLoop, EventLoopConfig, ShutdownHandle, DEFAULT_TIMEOUT};
pub use file::FileDescriptor;
pub use poller::{Interest, PollMechanism, Readiness};
pub use registry::{Registry, Token};

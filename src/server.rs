//! Multi-worker TCP server.
//!
//! Every worker thread owns one event loop and one registry. Listeners are
//! bound up front with `SO_REUSEPORT` so the kernel spreads connections
//! across workers; nothing is shared between workers except the shutdown
//! flag.

use crate::config::{Config, ProtocolType};
use crate::error::Error;
use crate::protocols::{Acceptor, EchoSession, PingSession};
use crate::runtime::{Dispatcher, EventLoop, Registry, ShutdownHandle, SocketDescriptor};
use std::io;
use std::net::SocketAddr;
use std::thread;
use tracing::{debug, error, info};

const LISTEN_BACKLOG: i32 = 1024;

pub struct Server {
    config: Config,
    listeners: Vec<SocketDescriptor>,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind one listening socket per worker.
    ///
    /// With port 0 the first socket picks the port and the rest join it.
    pub fn bind(config: Config) -> io::Result<Self> {
        let workers = if config.workers == 0 {
            num_cpus()
        } else {
            config.workers
        };

        let first = create_listener(config.listen)?;
        let local_addr = first.local_addr()?;
        let mut listeners = Vec::with_capacity(workers);
        listeners.push(first);
        for _ in 1..workers {
            listeners.push(create_listener(local_addr)?);
        }

        info!(addr = %local_addr, workers, "Listening");
        Ok(Self {
            config,
            listeners,
            local_addr,
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops every worker, interrupting their waits.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the workers until they all stop.
    pub fn run(self) -> io::Result<()> {
        let mut handles = Vec::with_capacity(self.listeners.len());

        for (worker_id, listener) in self.listeners.into_iter().enumerate() {
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, listener, &config, shutdown) {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }
        info!("All workers stopped");
        Ok(())
    }
}

fn worker_loop(
    worker_id: usize,
    listener: SocketDescriptor,
    config: &Config,
    shutdown: ShutdownHandle,
) -> crate::Result<()> {
    let registry = Registry::new();
    // Already listening since `Server::bind`, so early clients queue up.
    let listener = Dispatcher::listening(listener, &registry);

    match config.protocol {
        ProtocolType::Ping => listener.register(
            Acceptor::new(PingSession::new)
                .with_high_water(config.high_water)
                .with_max_connections(config.max_connections),
        )?,
        ProtocolType::Echo => listener.register(
            Acceptor::new(EchoSession::new)
                .with_high_water(config.high_water)
                .with_max_connections(config.max_connections),
        )?,
    };

    info!(worker = worker_id, protocol = ?config.protocol, "Worker started");

    let mut event_loop = EventLoop::new(config.event_loop, registry.clone())
        .map_err(Error::Poll)?
        .with_shutdown(shutdown);
    let result = match event_loop.run() {
        Err(Error::Shutdown) => Ok(()),
        other => other,
    };

    registry.close_all();
    debug!(worker = worker_id, iterations = event_loop.iterations(), "Worker stopped");
    result
}

fn create_listener(addr: SocketAddr) -> io::Result<SocketDescriptor> {
    let socket = SocketDescriptor::for_addr(&addr)?;
    socket.set_reuse_port()?;
    socket.set_reuse_addr()?;
    socket.bind(&addr)?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

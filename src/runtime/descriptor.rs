//! Descriptor adapters.
//!
//! A descriptor is the OS handle a dispatcher owns. Sockets and other
//! non-blocking devices are driven through the same recv/send/close surface,
//! so the dispatcher never needs to know which one it holds.
//!
//! Low-level calls never surface would-block as an error. They return an
//! [`IoOutcome`] that the dispatcher inspects.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Outcome of a single non-blocking call.
#[derive(Debug)]
pub enum IoOutcome<T = usize> {
    /// The call completed (for recv/send: number of bytes moved).
    Ready(T),
    /// Nothing could be done right now; retry on a later iteration.
    WouldBlock,
    /// The OS reported a real error.
    Error(io::Error),
}

impl<T> IoOutcome<T> {
    /// Classify a std result. `EINTR` is treated like would-block.
    pub fn from_io(res: io::Result<T>) -> Self {
        match res {
            Ok(v) => IoOutcome::Ready(v),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                IoOutcome::WouldBlock
            }
            Err(e) => IoOutcome::Error(e),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, IoOutcome::WouldBlock)
    }
}

/// Errors that mean the peer is gone rather than that something broke.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNRESET)
            | Some(libc::ENOTCONN)
            | Some(libc::ESHUTDOWN)
            | Some(libc::ECONNABORTED)
            | Some(libc::EPIPE)
            | Some(libc::EBADF)
    )
}

/// Uniform capability over a non-blocking OS handle.
pub trait Descriptor: fmt::Debug {
    /// Raw handle used for readiness registration.
    fn raw_fd(&self) -> RawFd;

    /// Non-blocking receive into `buf`. `Ready(0)` means end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome;

    /// Non-blocking send. May transmit only a prefix of `buf`.
    fn send(&mut self, buf: &[u8]) -> IoOutcome;

    /// Release the handle.
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }

    /// Socket-only operations, when the descriptor is a socket.
    fn as_socket(&self) -> Option<&SocketDescriptor> {
        None
    }
}

/// Non-blocking stream socket.
pub struct SocketDescriptor {
    socket: Socket,
}

impl SocketDescriptor {
    /// Create an unconnected TCP socket suitable for `addr`'s family.
    pub fn for_addr(addr: &SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        Self::from_socket(socket)
    }

    /// Adopt an existing socket, switching it to non-blocking mode.
    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Adopt a connected std stream.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        Self::from_socket(Socket::from(stream))
    }

    /// Start a non-blocking connect. In-progress connects report would-block.
    pub fn connect(&self, addr: &SocketAddr) -> IoOutcome<()> {
        match self.socket.connect(&SockAddr::from(*addr)) {
            Ok(()) => IoOutcome::Ready(()),
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.raw_os_error() == Some(libc::EALREADY) =>
            {
                IoOutcome::WouldBlock
            }
            Err(e) => IoOutcome::from_io(Err(e)),
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.socket.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.socket.listen(backlog)
    }

    /// Accept one pending connection as a new non-blocking socket.
    pub fn accept(&self) -> IoOutcome<(SocketDescriptor, SocketAddr)> {
        let (socket, addr) = match self.socket.accept() {
            Ok(pair) => pair,
            Err(e) => return IoOutcome::from_io(Err(e)),
        };
        let Some(peer) = addr.as_socket() else {
            return IoOutcome::Error(io::Error::new(
                io::ErrorKind::InvalidData,
                "accepted a non-IP peer",
            ));
        };
        match SocketDescriptor::from_socket(socket) {
            Ok(desc) => IoOutcome::Ready((desc, peer)),
            Err(e) => IoOutcome::Error(e),
        }
    }

    pub fn set_reuse_addr(&self) -> io::Result<()> {
        self.socket.set_reuse_address(true)
    }

    pub fn set_reuse_port(&self) -> io::Result<()> {
        self.socket.set_reuse_port(true)
    }

    /// Pending `SO_ERROR`, used to learn the outcome of a non-blocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.socket.peer_addr()?)
    }
}

fn to_socket_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an IP socket address"))
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

impl Descriptor for SocketDescriptor {
    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        IoOutcome::from_io(self.socket.read(buf))
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        IoOutcome::from_io(self.socket.send_with_flags(buf, SEND_FLAGS))
    }

    fn as_socket(&self) -> Option<&SocketDescriptor> {
        Some(self)
    }
}

impl fmt::Debug for SocketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketDescriptor")
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

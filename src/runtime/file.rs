//! File-descriptor adapter for non-socket devices (pipes, ttys, eventfds).
//!
//! Regular files are always "ready" and cannot be registered with epoll, so
//! this is meant for stream-like fds.

use crate::runtime::descriptor::{Descriptor, IoOutcome};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub struct FileDescriptor {
    fd: OwnedFd,
}

impl FileDescriptor {
    /// Take ownership of `fd` and switch it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// Duplicate a borrowed fd so the dispatcher owns an independent handle.
    pub fn duplicate(fd: BorrowedFd<'_>) -> io::Result<Self> {
        Self::new(fd.try_clone_to_owned()?)
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid, owned fd with integer flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn cvt(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl Descriptor for FileDescriptor {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(self.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        IoOutcome::from_io(cvt(n))
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        // SAFETY: buf is a valid readable region of buf.len() bytes.
        let n = unsafe { libc::write(self.raw_fd(), buf.as_ptr().cast(), buf.len()) };
        IoOutcome::from_io(cvt(n))
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let fd = self.fd.into_raw_fd();
        // SAFETY: fd came out of an OwnedFd and is closed exactly once here.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Create a pipe, returning (read end, write end).
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() just handed us two fresh fds.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

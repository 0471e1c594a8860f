//! Session operations abstraction
//!
//! Everything above the socket (HTTP clients, WebSocket clients, the server
//! sessions) talks to a `SessionOps` so the same code runs over plain TCP
//! and TLS.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Session operations trait
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Descriptor of the underlying socket
    fn raw_fd(&self) -> RawFd;

    /// Bytes already decoded and waiting inside the session layer
    ///
    /// Plain sockets never buffer; TLS may hold a decrypted record that a
    /// descriptor poll cannot see.
    fn pending(&self) -> usize {
        0
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Wait for readiness on a raw descriptor
///
/// `None` waits forever. Returns false on timeout.
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }

    Ok(result > 0)
}

/// Session that gives up on reads and writes after a deadline
///
/// Clients sit on top of this; server connections poll the raw
/// `SessionOps` themselves.
pub struct TimedSession<S: SessionOps> {
    inner: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> TimedSession<S> {
    pub fn new(inner: S) -> Self {
        TimedSession {
            inner,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// `None` blocks forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn wait(&self, events: PollEvents) -> Result<()> {
        // Decrypted bytes already sitting in the session count as readable
        if events == PollEvents::Read && self.inner.pending() > 0 {
            return Ok(());
        }
        match self.inner.poll(events, self.timeout)? {
            true => Ok(()),
            false => Err(Error::Timeout),
        }
    }

    /// Read whatever is available, failing with `Error::Timeout` on a quiet peer
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.wait(PollEvents::Read)?;
        self.inner.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.wait(PollEvents::Write)?;
        self.inner.write(buf)
    }

    /// Write the whole buffer
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

/// Plain TCP session
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr().map_err(Error::from)
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.stream.write(buf)?)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

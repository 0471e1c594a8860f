//! Server-side sessions
//!
//! A `Session` is what services see of one connected client. Writes go
//! through a `SessionSink`, so the same session type covers stream sockets
//! (plain or TLS), UDP peers and upgraded WebSocket connections.

use super::SessionId;
use crate::http::SessionOps;
use crate::peer::codec::{self, Message};
use crate::stats::NetworkStatistics;
use crate::ws::{encode_frame, Opcode};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Where a session's bytes go
pub trait SessionSink: Send + Sync {
    /// Write all of `data`
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Stop the underlying connection
    fn shutdown(&self);
}

/// Sink over a locked `SessionOps`, shared with the session's read loop
pub struct StreamSink<S: SessionOps> {
    ops: Arc<Mutex<S>>,
}

impl<S: SessionOps> StreamSink<S> {
    pub fn new(ops: Arc<Mutex<S>>) -> Self {
        StreamSink { ops }
    }
}

fn to_io(error: crate::http::Error) -> io::Error {
    match error {
        crate::http::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl<S: SessionOps + Send> SessionSink for StreamSink<S> {
    fn send(&self, mut data: &[u8]) -> io::Result<()> {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        while !data.is_empty() {
            let n = ops.write(data).map_err(to_io)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            data = &data[n..];
        }
        Ok(())
    }

    fn shutdown(&self) {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = ops.close();
    }
}

/// Sink answering one UDP peer from the server socket
pub struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        DatagramSink { socket, peer }
    }
}

impl SessionSink for DatagramSink {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let n = self.socket.send_to(data, self.peer)?;
        if n != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"));
        }
        Ok(())
    }

    fn shutdown(&self) {}
}

/// How `send_message` frames operation messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Framing {
    /// Length-prefixed frames straight on the socket
    Raw = 0,
    /// Each frame wrapped in an unmasked binary WebSocket message
    WebSocket = 1,
}

/// One connected client
pub struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    sink: Box<dyn SessionSink>,
    framing: AtomicU8,
    connected: AtomicBool,
    statistics: Arc<NetworkStatistics>,
}

impl Session {
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        sink: Box<dyn SessionSink>,
        statistics: Arc<NetworkStatistics>,
    ) -> Self {
        Session {
            id,
            remote_addr,
            sink,
            framing: AtomicU8::new(Framing::Raw as u8),
            connected: AtomicBool::new(true),
            statistics,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn framing(&self) -> Framing {
        if self.framing.load(Ordering::Acquire) == Framing::WebSocket as u8 {
            Framing::WebSocket
        } else {
            Framing::Raw
        }
    }

    pub fn set_framing(&self, framing: Framing) {
        self.framing.store(framing as u8, Ordering::Release);
    }

    /// Write raw bytes
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.sink.send(data)?;
        self.statistics.add_sent(data.len());
        Ok(())
    }

    /// Encode and write an operation message with this session's framing
    pub fn send_message(&self, message: &Message) -> io::Result<()> {
        let frame = codec::encode(message);
        match self.framing() {
            Framing::Raw => self.send(&frame),
            Framing::WebSocket => {
                let mut out = Vec::with_capacity(frame.len() + 10);
                encode_frame(&mut out, Opcode::Binary, true, None, &frame, 0);
                self.send(&out)
            }
        }
    }

    /// Close the connection; returns false if it was already closed
    pub fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.sink.shutdown();
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("framing", &self.framing())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::OperationEvent;
    use bytes::Bytes;

    #[derive(Default)]
    struct Capture {
        written: Mutex<Vec<u8>>,
        shut: AtomicBool,
    }

    impl SessionSink for Arc<Capture> {
        fn send(&self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
        }
    }

    fn session(capture: &Arc<Capture>) -> Session {
        Session::new(
            SessionId(7),
            "127.0.0.1:9000".parse().unwrap(),
            Box::new(Arc::clone(capture)),
            Arc::new(NetworkStatistics::new()),
        )
    }

    #[test]
    fn test_framing() {
        let capture = Arc::new(Capture::default());
        let session = session(&capture);
        let message = Message::Event(OperationEvent::new(1, Bytes::from_static(b"x")));
        let frame = codec::encode(&message);

        session.send_message(&message).unwrap();
        assert_eq!(*capture.written.lock().unwrap(), frame.to_vec());

        capture.written.lock().unwrap().clear();
        session.set_framing(Framing::WebSocket);
        session.send_message(&message).unwrap();
        let written = capture.written.lock().unwrap().clone();
        assert_eq!(written[0], 0x82);
        assert_eq!(written[1] as usize, frame.len());
        assert_eq!(&written[2..], frame.as_ref());
        assert_eq!(session.statistics.packets_sent(), 2);
    }

    #[test]
    fn test_disconnect_once() {
        let capture = Arc::new(Capture::default());
        let session = session(&capture);
        assert!(session.disconnect());
        assert!(!session.disconnect());
        assert!(capture.shut.load(Ordering::SeqCst));
        assert_eq!(
            session.send(b"late").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}

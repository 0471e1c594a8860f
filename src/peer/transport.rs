//! Transports that carry operation messages for a `ClientPeer`

use super::codec::{self, FrameReader, Message};
use super::{Error, Result};
use crate::config::ClientSettings;
use crate::stats::NetworkStatistics;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest message accepted from a server
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Connection used by a `ClientPeer`
pub trait PeerTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write one message
    fn send_message(&self, message: &Message) -> Result<()>;

    /// Next message received from the server, without blocking
    fn try_receive(&self) -> Option<Message>;

    fn disconnect(&self);
}

/// TCP transport with a background reader thread
///
/// The reader decodes frames and hands them over through a channel, so
/// `try_receive` never touches the socket.
pub struct TcpPeerTransport {
    stream: Mutex<TcpStream>,
    connected: Arc<AtomicBool>,
    incoming: Mutex<Receiver<Message>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    statistics: Arc<NetworkStatistics>,
    peer_addr: SocketAddr,
}

impl TcpPeerTransport {
    /// Connect with the socket options from `settings`
    pub fn connect(addr: SocketAddr, settings: &ClientSettings) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(settings.tcp_no_delay)?;
        if settings.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(settings.receive_buffer_size)?;
        }
        let target = SockAddr::from(addr);
        if settings.connect_timeout_ms > 0 {
            socket.connect_timeout(&target, Duration::from_millis(settings.connect_timeout_ms))?;
        } else {
            socket.connect(&target)?;
        }

        let stream: TcpStream = socket.into();
        Self::from_stream(stream, settings.receive_buffer_size.max(1024))
    }

    fn from_stream(stream: TcpStream, read_chunk: usize) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let reader_stream = stream.try_clone()?;
        let connected = Arc::new(AtomicBool::new(true));
        let statistics = Arc::new(NetworkStatistics::new());
        let (tx, rx) = mpsc::channel();

        let reader = {
            let connected = Arc::clone(&connected);
            let statistics = Arc::clone(&statistics);
            thread::Builder::new()
                .name("protonnet-peer-reader".into())
                .spawn(move || read_loop(reader_stream, read_chunk, tx, &connected, &statistics))?
        };

        statistics.add_session_connected();
        tracing::debug!(%peer_addr, "peer transport connected");

        Ok(TcpPeerTransport {
            stream: Mutex::new(stream),
            connected,
            incoming: Mutex::new(rx),
            reader: Mutex::new(Some(reader)),
            statistics,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }
}

fn read_loop(
    mut stream: TcpStream,
    read_chunk: usize,
    tx: Sender<Message>,
    connected: &AtomicBool,
    statistics: &NetworkStatistics,
) {
    let mut reader = FrameReader::new(MAX_MESSAGE_SIZE);
    let mut buf = vec![0u8; read_chunk];

    'read: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if connected.load(Ordering::Acquire) {
                    tracing::debug!(error = %e, "peer transport read failed");
                }
                break;
            }
        };
        statistics.add_received(n);
        reader.push(&buf[..n]);

        loop {
            match reader.next_message() {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable message from server");
                    break 'read;
                }
            }
        }
    }

    if connected.swap(false, Ordering::AcqRel) {
        statistics.add_session_disconnected();
    }
    let _ = stream.shutdown(Shutdown::Both);
}

impl PeerTransport for TcpPeerTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let frame = codec::encode(message);
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&frame)?;
        self.statistics.add_sent(frame.len());
        Ok(())
    }

    fn try_receive(&self) -> Option<Message> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.statistics.add_session_disconnected();
            tracing::debug!(peer_addr = %self.peer_addr, "peer transport disconnected");
        }
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl Drop for TcpPeerTransport {
    fn drop(&mut self) {
        self.disconnect();
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{OperationEvent, OperationRequest};
    use bytes::Bytes;
    use std::net::TcpListener;
    use std::time::Instant;

    fn wait_for(transport: &TcpPeerTransport) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(message) = transport.try_receive() {
                return message;
            }
            assert!(Instant::now() < deadline, "no message received");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::new(1024);
            let mut buf = [0u8; 256];
            let request = loop {
                let n = stream.read(&mut buf).unwrap();
                reader.push(&buf[..n]);
                if let Some(message) = reader.next_message().unwrap() {
                    break message;
                }
            };
            let event = codec::encode(&Message::Event(OperationEvent::new(2, Bytes::from_static(b"hi"))));
            // Split the frame to exercise reassembly
            stream.write_all(&event[..3]).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(&event[3..]).unwrap();
            request
        });

        let transport = TcpPeerTransport::connect(addr, &ClientSettings::default()).unwrap();
        assert!(transport.is_connected());
        let request = OperationRequest::new(4, Bytes::from_static(b"req"));
        transport.send_message(&Message::Request(request.clone())).unwrap();

        let event = wait_for(&transport);
        assert_eq!(event, Message::Event(OperationEvent::new(2, Bytes::from_static(b"hi"))));
        assert_eq!(server.join().unwrap(), Message::Request(request));

        transport.disconnect();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send_message(&Message::Event(OperationEvent::new(1, Bytes::new()))),
            Err(Error::NotConnected)
        ));
        let snapshot = transport.statistics().snapshot();
        assert_eq!(snapshot.sessions_disconnected, 1);
    }
}

//! Blocking WebSocket client
//!
//! The upgrade request goes through `HttpClient`; any frame bytes that
//! arrive in the same read as the 101 response are kept and decoded before
//! the next socket read.

use super::{Error, Opcode, Result, WebSocket, WsHandler, CLOSE_NORMAL};
use crate::http::{HttpClient, HttpRequest, HttpResponse, SessionOps};
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// WebSocket client over any `SessionOps`
pub struct WsClient<S: SessionOps> {
    http: HttpClient<S>,
    engine: WebSocket,
    backlog: Vec<u8>,
    close_sent: bool,
    closed: bool,
}

/// Wraps the caller's handler so control frames can be answered after
/// decoding finishes
struct Replies<'a, H: ?Sized> {
    inner: &'a mut H,
    pings: Vec<Vec<u8>>,
    close: Option<u16>,
}

impl<H: WsHandler + ?Sized> WsHandler for Replies<'_, H> {
    fn on_ws_connecting(&mut self, request: &HttpRequest, response: &mut HttpResponse) -> bool {
        self.inner.on_ws_connecting(request, response)
    }

    fn on_ws_connected(&mut self, request: &HttpRequest) {
        self.inner.on_ws_connected(request)
    }

    fn on_ws_received(&mut self, data: &[u8]) {
        self.inner.on_ws_received(data)
    }

    fn on_ws_close(&mut self, data: &[u8], status: u16) {
        self.close.get_or_insert(status);
        self.inner.on_ws_close(data, status)
    }

    fn on_ws_ping(&mut self, data: &[u8]) {
        self.pings.push(data.to_vec());
        self.inner.on_ws_ping(data)
    }

    fn on_ws_pong(&mut self, data: &[u8]) {
        self.inner.on_ws_pong(data)
    }

    fn on_ws_error(&mut self, error: &str) {
        self.inner.on_ws_error(error)
    }
}

impl<S: SessionOps> WsClient<S> {
    pub fn new(session: S) -> Self {
        WsClient {
            http: HttpClient::new(session),
            engine: WebSocket::client(),
            backlog: Vec::new(),
            close_sent: false,
            closed: false,
        }
    }

    /// Read timeout; `None` blocks until data arrives
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.http.session_mut().set_timeout(timeout);
    }

    /// Largest frame or reassembled message accepted from the server
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.engine.set_max_message_size(max_message_size);
    }

    /// Perform the opening handshake
    pub fn connect(&mut self, host: &str, path: &str) -> Result<()> {
        let mut request = HttpRequest::new();
        self.engine.make_client_upgrade_request(&mut request, host, path);
        self.http.send_request(&request)?;

        let response = self.http.receive_response()?;
        self.engine.perform_client_upgrade(response)?;
        self.backlog = response.surplus().to_vec();
        self.close_sent = false;
        self.closed = false;

        tracing::debug!(host, path, "WebSocket connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_handshaked() && !self.closed
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes(), 0)
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Binary, data, 0)
    }

    pub fn send_ping(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Ping, data, 0)
    }

    /// Send a Close frame; the connection stays readable until the peer
    /// answers
    pub fn close(&mut self, status: u16) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.send_frame(Opcode::Close, &[], status)?;
        self.close_sent = true;
        Ok(())
    }

    /// Read once and dispatch every completed frame to `handler`
    ///
    /// Pings are answered with pongs. A Close from the peer is echoed and
    /// the socket shut down. Returns `Error::Closed` once the peer is gone.
    pub fn receive<H: WsHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        if !self.engine.is_handshaked() {
            return Err(Error::NotConnected);
        }
        if self.closed {
            return Err(Error::Closed);
        }

        let data = if self.backlog.is_empty() {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = self.http.session_mut().read(&mut buf)?;
            if n == 0 {
                self.closed = true;
                return Err(Error::Closed);
            }
            buf.truncate(n);
            buf
        } else {
            std::mem::take(&mut self.backlog)
        };

        let mut replies = Replies {
            inner: handler,
            pings: Vec::new(),
            close: None,
        };
        self.engine.prepare_receive_frame(&data, &mut replies);
        let Replies { pings, close, .. } = replies;

        for ping in pings {
            self.send_frame(Opcode::Pong, &ping, 0)?;
        }
        if let Some(status) = close {
            if !self.close_sent {
                let status = if status == 0 { CLOSE_NORMAL } else { status };
                self.send_frame(Opcode::Close, &[], status)?;
                self.close_sent = true;
            }
            self.closed = true;
            self.http.close()?;
        }
        Ok(())
    }

    fn send_frame(&mut self, opcode: Opcode, payload: &[u8], status: u16) -> Result<()> {
        if !self.engine.is_handshaked() {
            return Err(Error::NotConnected);
        }
        if self.closed {
            return Err(Error::Closed);
        }
        let frame = self.engine.prepare_send_frame(opcode, true, true, payload, status);
        self.http.session_mut().write_all(frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use crate::ws::Upgrade;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[derive(Default)]
    struct Collect {
        messages: Vec<Vec<u8>>,
        pongs: Vec<Vec<u8>>,
        closes: Vec<u16>,
    }

    impl WsHandler for Collect {
        fn on_ws_received(&mut self, data: &[u8]) {
            self.messages.push(data.to_vec());
        }

        fn on_ws_pong(&mut self, data: &[u8]) {
            self.pongs.push(data.to_vec());
        }

        fn on_ws_close(&mut self, _data: &[u8], status: u16) {
            self.closes.push(status);
        }
    }

    /// Echo server: upgrades, greets in the same write as the 101, then
    /// echoes messages until a Close arrives
    fn echo_server(mut stream: TcpStream) {
        let mut request = HttpRequest::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0);
            let mut data = &buf[..n];
            if request.is_pending_header() {
                request.set_header_buffer(data);
                data = &[];
            }
            assert!(!request.is_error_set());
            if request.is_pending_body() && request.set_body_buffer(data) {
                break;
            }
        }

        let mut engine = WebSocket::server();
        let mut response = HttpResponse::new();
        let mut handler = Collect::default();
        let outcome = engine.perform_server_upgrade(&request, &mut response, &mut handler);
        assert_eq!(outcome, Upgrade::Accepted);

        let mut first = response.cache().to_vec();
        first.extend_from_slice(engine.prepare_message(Opcode::Text, b"welcome"));
        stream.write_all(&first).unwrap();

        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                return;
            }
            let mut frames = Collect::default();
            engine.prepare_receive_frame(&buf[..n], &mut frames);
            for message in frames.messages {
                let echo = engine.prepare_message(Opcode::Binary, &message).to_vec();
                stream.write_all(&echo).unwrap();
            }
            if let Some(status) = frames.closes.first() {
                let reply = engine
                    .prepare_send_frame(Opcode::Close, true, false, &[], *status)
                    .to_vec();
                stream.write_all(&reply).unwrap();
                return;
            }
        }
    }

    #[test]
    fn test_echo_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            echo_server(stream);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = WsClient::new(FdSessionOps::new(stream));
        client.connect("127.0.0.1", "/echo").unwrap();
        assert!(client.is_connected());

        let mut handler = Collect::default();
        client.receive(&mut handler).unwrap();
        assert_eq!(handler.messages, vec![b"welcome".to_vec()]);

        client.send_text("ping me back").unwrap();
        while handler.messages.len() < 2 {
            client.receive(&mut handler).unwrap();
        }
        assert_eq!(handler.messages[1], b"ping me back".to_vec());

        client.close(CLOSE_NORMAL).unwrap();
        while handler.closes.is_empty() {
            client.receive(&mut handler).unwrap();
        }
        assert_eq!(handler.closes, vec![CLOSE_NORMAL]);
        assert!(!client.is_connected());
        assert!(matches!(client.send_text("late"), Err(Error::Closed)));

        server.join().unwrap();
    }

    #[test]
    fn test_send_before_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut client = WsClient::new(FdSessionOps::new(stream));
        assert!(matches!(client.send_text("x"), Err(Error::NotConnected)));
        assert!(matches!(
            client.receive(&mut Collect::default()),
            Err(Error::NotConnected)
        ));
    }
}

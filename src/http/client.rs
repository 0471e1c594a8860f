//! Blocking HTTP client
//!
//! Sends composed `HttpRequest`s over a `SessionOps` and reads responses
//! with the incremental `HttpResponse` parser. One response object is
//! reused across calls.

use super::{Error, HttpRequest, HttpResponse, TimedSession, Result, SessionOps};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// HTTP client
pub struct HttpClient<S: SessionOps> {
    session: TimedSession<S>,
    request: HttpRequest,
    response: HttpResponse,
    host: String,
}

impl<S: SessionOps> HttpClient<S> {
    /// Create a new HTTP client with a session
    pub fn new(session: S) -> Self {
        HttpClient {
            session: TimedSession::new(session),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            host: "localhost".to_string(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(Some(timeout));
    }

    /// Host header used by `get` and `post`
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// Write a composed request
    pub fn send_request(&mut self, request: &HttpRequest) -> Result<()> {
        self.session.write_all(request.cache().as_slice())
    }

    /// Read one complete response
    pub fn receive_response(&mut self) -> Result<&HttpResponse> {
        self.response.clear();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let n = self.session.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            let mut data = &buf[..n];

            if self.response.is_pending_header() {
                self.response.set_header_buffer(data);
                data = &[];
            }
            if self.response.is_error_set() {
                return Err(Error::Parse("malformed response header".into()));
            }
            if self.response.is_pending_body() && self.response.set_body_buffer(data) {
                return Ok(&self.response);
            }
        }
    }

    /// Send `GET url` and wait for the response
    pub fn get(&mut self, url: &str) -> Result<&HttpResponse> {
        let mut request = std::mem::take(&mut self.request);
        request
            .set_begin("GET", url)
            .set_header("Host", &self.host)
            .set_body(&[]);
        let sent = self.send_request(&request);
        self.request = request;
        sent?;
        self.receive_response()
    }

    /// Send `POST url` with a body and wait for the response
    pub fn post(&mut self, url: &str, body: &[u8], content_type: &str) -> Result<&HttpResponse> {
        let mut request = std::mem::take(&mut self.request);
        request.set_begin("POST", url).set_header("Host", &self.host);
        if !content_type.is_empty() {
            request.set_header("Content-Type", content_type);
        }
        request.set_body(body);
        let sent = self.send_request(&request);
        self.request = request;
        sent?;
        self.receive_response()
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn session(&self) -> &TimedSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut TimedSession<S> {
        &mut self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_send_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));

        let mut request = HttpRequest::new();
        request.set_begin("GET", "/").set_header("Host", "localhost").set_body(&[]);
        client.send_request(&request).unwrap();

        let received = handle.join().unwrap();
        assert!(received.starts_with("GET / HTTP/1.1\r\n"));
        assert!(received.contains("Host: localhost\r\n"));
    }

    #[test]
    fn test_receive_response_split_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();

            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(b"Content-Length: 5\r\n\r\nHel").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(b"lo").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));

        let response = client.get("/").unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"Hello");
        assert_eq!(response.header("Content-Type"), Some("text/plain"));

        handle.join().unwrap();
    }

    #[test]
    fn test_post_helper() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = HttpRequest::new();
            let mut buf = vec![0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if request.is_pending_header() {
                    if request.set_header_buffer(&buf[..n]) && request.set_body_buffer(&[]) {
                        break;
                    }
                } else if request.set_body_buffer(&buf[..n]) {
                    break;
                }
            }
            let echo = request.body().to_vec();
            let mut response = HttpResponse::new();
            response.make_get_response(&echo, "text/plain");
            stream.write_all(response.cache().as_slice()).unwrap();
            request.url().to_string()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));

        let response = client.post("/echo", b"ping", "text/plain").unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"ping");

        assert_eq!(handle.join().unwrap(), "/echo");
    }

    #[test]
    fn test_connection_closed_before_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));
        handle.join().unwrap();

        assert!(matches!(client.receive_response(), Err(Error::ConnectionClosed)));
    }
}

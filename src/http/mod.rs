//! HTTP/1.1 wire layer for ProtonNet
//!
//! This module provides the incremental HTTP request/response parsers and
//! composers used by the web API server and the HTTP/WebSocket clients.
//!
//! # Architecture
//!
//! `HttpRequest` and `HttpResponse` each own one `MemoryBuffer` holding the
//! exact wire bytes written so far. On the send path the message is composed
//! in place (`set_begin` → `set_header`/`set_cookie` → `set_body`) and the
//! cache is written to the socket as-is. On the receive path raw socket reads
//! are appended with `set_header_buffer` until the blank line is seen, then
//! with `set_body_buffer` until the body is complete:
//!
//! ```text
//! Empty ──► PendingHeader ──► PendingBody ──► Complete
//!                │
//!                └──► ErrorSet (malformed header block)
//! ```
//!
//! The I/O side uses a session operations abstraction so the same code runs
//! over plain TCP and TLS:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `FdSessionOps` implements them for a plain `TcpStream`
//! - `tls::TlsSessionOps` implements them over OpenSSL
//!
//! # Examples
//!
//! ```no_run
//! use protonnet::http::{HttpClient, HttpRequest};
//! use protonnet::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut client = HttpClient::new(FdSessionOps::new(stream));
//!
//! let mut request = HttpRequest::new();
//! request.make_get_request("/");
//! client.send_request(&request).unwrap();
//!
//! let response = client.receive_response().unwrap();
//! assert_eq!(response.status(), 200);
//! ```

pub mod client;
pub mod headers;
pub mod message;
pub mod parser;
pub mod request;
pub mod response;
pub mod session;
pub mod tls;

pub use client::HttpClient;
pub use headers::{Cookies, Headers};
pub use message::{Method, ParseState, Status};
pub use request::HttpRequest;
pub use response::{HttpResponse, SetCookie};
pub use session::{SessionOps, TimedSession};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::buffer::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Protocol written by the composers
pub const HTTP_PROTOCOL: &str = "HTTP/1.1";

/// CRLF line ending
pub const CRLF: &str = "\r\n";

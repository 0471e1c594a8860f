//! Server runtime
//!
//! Every server owns a `ServerContext`: its settings, a tracing span, the
//! session registry, two fiber pools and the request admission gates.
//!
//! - `received` fiber: request dispatch (operation handlers, web API routes)
//! - `other` fiber: connect, disconnect and error callbacks
//!
//! I/O happens on one thread per connection (TCP, TLS, HTTP, WebSocket) or
//! one receive thread per socket (UDP). Those threads never run user code
//! except `SocketService::on_received`, which is expected to hand work off.

pub mod admission;
pub mod fiber;
pub mod group;
pub mod http;
pub mod session;
pub mod socket;
pub mod udp;
pub mod web_api;

pub use admission::{AdmissionGuard, Rejection, RequestAdmission};
pub use fiber::Fiber;
pub use group::ServerGroup;
pub use http::{HttpServer, WsServer};
pub use session::{Framing, Session, SessionSink};
pub use socket::{OperationService, ServerContext, SocketServer, SocketService, TcpServer};
pub use udp::UdpServer;
pub use web_api::{HandlerError, Router, StaticContentCache, WebApiControllerService};

use std::fmt;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::http::tls::TlsError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::Error),

    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Server {0} is already running")]
    AlreadyStarted(String),
}

/// Identity of one connected session within a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//! TLS transport
//!
//! The SSL transport of the servers and clients is plain TCP wrapped in an
//! OpenSSL stream:
//!
//! 1. `TlsConfig` holds the OpenSSL context (versions, certificate, ALPN)
//! 2. `TlsSessionOps` implements `SessionOps` for encrypted I/O
//! 3. Code above `SessionOps` is unchanged
//!
//! # Examples
//!
//! ```no_run
//! use protonnet::http::tls::{TlsConfig, TlsVersion};
//! use protonnet::http::HttpClient;
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .version(TlsVersion::Tls13)
//!     .servername("localhost")
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("127.0.0.1:8443").unwrap();
//! let tls_session = tls_config.connect(tcp_stream).unwrap();
//! let mut client = HttpClient::new(tls_session);
//! let response = client.get("/").unwrap();
//! println!("{}", response.status());
//! ```

pub mod cert;
pub mod config;
pub mod session;

pub use cert::CertInfo;
pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

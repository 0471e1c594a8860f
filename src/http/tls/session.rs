//! TLS session operations

use super::cert::CertInfo;
use super::config::{TlsConfig, TlsError};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// TLS session operations
///
/// Wraps an OpenSSL `SslStream` after a completed blocking handshake.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Client handshake
    pub fn connect(tcp_stream: TcpStream, config: &TlsConfig) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;
        if let Some(servername) = &config.servername {
            ssl.set_hostname(servername)?;
        }

        let stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Connection failed: {}", e)))?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Server handshake
    pub fn accept(tcp_stream: TcpStream, config: &TlsConfig) -> Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;
        let stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Negotiated protocol version, e.g. `TLSv1.3`
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Protocol selected through ALPN
    pub fn alpn_protocol(&self) -> Option<String> {
        self.stream
            .ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    pub fn peer_certificate(&self) -> Option<CertInfo> {
        self.stream
            .ssl()
            .peer_certificate()
            .map(|cert| CertInfo::from_x509_ref(&cert))
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        if events != PollEvents::Write && self.pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn pending(&self) -> usize {
        self.stream.ssl().pending()
    }
}

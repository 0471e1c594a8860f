//! TLS configuration
//!
//! Builders collect options and create the OpenSSL context in `build()`,
//! so every OpenSSL failure surfaces there as a `TlsError`.

use crate::config::TlsSettings;
use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
}

impl TlsConfig {
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Server configuration from the `[server.tls]` settings table
    pub fn from_settings(settings: &TlsSettings) -> Result<TlsConfig, TlsError> {
        let mut builder = TlsConfig::server();
        if let Some(cert) = &settings.cert_file {
            builder = builder.cert_file(cert, settings.key_file.as_ref());
        }
        let min = settings.min_version.as_deref().map(TlsVersion::from_str).transpose()?;
        let max = settings.max_version.as_deref().map(TlsVersion::from_str).transpose()?;
        builder = builder.version_range(min, max);
        if !settings.alpn.is_empty() {
            builder = builder.alpn(settings.alpn.iter().map(String::as_str));
        }
        builder.build()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Connect to a server with TLS (client-side)
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::TlsSessionOps::connect(stream, self)
    }

    /// Accept a client connection with TLS (server-side)
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::TlsSessionOps::accept(stream, self)
    }
}

fn set_versions(
    ctx: &mut SslContextBuilder,
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Result<(), TlsError> {
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(TlsError::InvalidConfig(format!(
                "minimum version {} above maximum {}",
                min.as_str(),
                max.as_str()
            )));
        }
    }
    ctx.set_min_proto_version(min.map(|v| v.to_openssl_version()))?;
    ctx.set_max_proto_version(max.map(|v| v.to_openssl_version()))?;
    Ok(())
}

/// Encode protocols in the ALPN wire format (length-prefixed)
fn alpn_wire(protocols: &[String]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .map_err(|_| TlsError::InvalidConfig(format!("ALPN protocol too long: {}", proto)))?;
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Load a PEM certificate and key (the key may live in the same file)
fn load_identity(ctx: &mut SslContextBuilder, cert: &Path, key: Option<&Path>) -> Result<(), TlsError> {
    let cert_pem = fs::read(cert)?;
    let key_pem = match key {
        Some(path) => fs::read(path)?,
        None => cert_pem.clone(),
    };

    let cert = X509::from_pem(&cert_pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    let key = PKey::private_key_from_pem(&key_pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

    ctx.set_certificate(&cert)?;
    ctx.set_private_key(&key)?;
    ctx.check_private_key()?;
    Ok(())
}

/// Client configuration builder
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
    alpn: Vec<String>,
    servername: Option<String>,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(Some(version), Some(version))
    }

    /// Set TLS version range; `None` leaves a bound at the library default
    pub fn version_range(mut self, min: Option<TlsVersion>, max: Option<TlsVersion>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn alpn<'a>(mut self, protocols: impl IntoIterator<Item = &'a str>) -> Self {
        self.alpn = protocols.into_iter().map(str::to_string).collect();
        self
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust anchors for peer verification
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        set_versions(&mut ctx, self.min, self.max)?;

        if self.verify_peer {
            ctx.set_verify(SslVerifyMode::PEER);
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }
        if let Some(ca) = &self.ca_file {
            ctx.set_ca_file(ca)?;
        }
        if !self.alpn.is_empty() {
            ctx.set_alpn_protos(&alpn_wire(&self.alpn)?)?;
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: false,
            servername: self.servername,
        })
    }
}

/// Server configuration builder
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
    alpn: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

impl ServerConfigBuilder {
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(Some(version), Some(version))
    }

    pub fn version_range(mut self, min: Option<TlsVersion>, max: Option<TlsVersion>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Protocols the server accepts, in preference order of the client
    pub fn alpn<'a>(mut self, protocols: impl IntoIterator<Item = &'a str>) -> Self {
        self.alpn = protocols.into_iter().map(str::to_string).collect();
        self
    }

    /// PEM certificate, with the key in `key` or in the same file
    pub fn cert_file(mut self, cert: impl Into<PathBuf>, key: Option<impl Into<PathBuf>>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = key.map(Into::into);
        self
    }

    /// Build the configuration, generating a self-signed certificate when
    /// none was given
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        set_versions(&mut ctx, self.min, self.max)?;

        match &self.cert_file {
            Some(cert) => load_identity(&mut ctx, cert, self.key_file.as_deref())?,
            None => {
                let (cert, key) = super::cert::self_signed("localhost")?;
                ctx.set_certificate(&cert)?;
                ctx.set_private_key(&key)?;
            }
        }

        if !self.alpn.is_empty() {
            let accepted: Vec<Vec<u8>> = self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
            ctx.set_alpn_select_callback(move |_ssl, client_protos| {
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    if pos + len > client_protos.len() {
                        break;
                    }
                    let candidate = &client_protos[pos..pos + len];
                    if accepted.iter().any(|p| p.as_slice() == candidate) {
                        return Ok(candidate);
                    }
                    pos += len;
                }
                Err(AlpnError::NOACK)
            });
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: true,
            servername: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("SSLv3".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .alpn(["http/1.1"])
            .build()
            .unwrap();

        assert!(!config.is_server());
        assert_eq!(config.servername, Some("example.com".to_string()));
    }

    #[test]
    fn test_server_config_self_signed() {
        let config = TlsConfig::server()
            .version_range(Some(TlsVersion::Tls12), Some(TlsVersion::Tls13))
            .build()
            .unwrap();
        assert!(config.is_server());
    }

    #[test]
    fn test_inverted_version_range_rejected() {
        let result = TlsConfig::client()
            .version_range(Some(TlsVersion::Tls13), Some(TlsVersion::Tls12))
            .build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_settings_with_pem_file() {
        let (cert, key) = super::super::cert::self_signed("localhost").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&cert.to_pem().unwrap()).unwrap();
        file.write_all(&key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        file.flush().unwrap();

        let settings = TlsSettings {
            enabled: true,
            cert_file: Some(file.path().to_path_buf()),
            key_file: None,
            min_version: Some("TLSv1.2".into()),
            max_version: None,
            alpn: vec!["http/1.1".into()],
        };
        assert!(TlsConfig::from_settings(&settings).unwrap().is_server());

        let missing = TlsSettings {
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..settings
        };
        assert!(matches!(TlsConfig::from_settings(&missing), Err(TlsError::Io(_))));
    }
}

//! Typed settings
//!
//! Plain structs with named fields and defaults. Every table is optional in
//! TOML; missing fields take the values from the `Default` impls.
//!
//! ```toml
//! log_filter = "protonnet=debug"
//!
//! [server]
//! name = "game"
//! bind_address = "0.0.0.0:32202"
//! max_session_request_per_second = 50
//!
//! [server.tls]
//! enabled = true
//! cert_file = "server.pem"
//!
//! [client]
//! send_rate = 30
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result type for configuration loading
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Root settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtonNetSettings {
    /// Default tracing directives when `RUST_LOG` is unset
    pub log_filter: String,
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl Default for ProtonNetSettings {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}

impl ProtonNetSettings {
    /// Parse and validate settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: ProtonNetSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Semantic checks serde cannot express; reports every problem found
    pub fn validate(&self) -> Result<()> {
        let mut problems = self.server.problems();
        problems.extend(self.client.problems());
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid(problems))
        }
    }
}

/// Settings of one server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name used in log spans
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Server-wide in-flight request ceiling (0 = unlimited)
    pub max_pending_request: usize,

    /// Per-session in-flight request ceiling (0 = unlimited)
    pub max_session_pending_request: usize,

    /// Per-session requests per one-second window (0 = unlimited)
    pub max_session_request_per_second: usize,

    /// Workers of the fiber running received work
    pub receive_fiber_threads: usize,

    /// Workers of the fiber running connect, disconnect and error callbacks
    pub other_fiber_threads: usize,

    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub tcp_no_delay: bool,
    pub reuse_address: bool,
    pub listen_backlog: i32,

    /// Largest accepted operation message in bytes
    pub max_message_size: usize,

    pub tls: TlsSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "protonnet".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            max_pending_request: 0,
            max_session_pending_request: 0,
            max_session_request_per_second: 0,
            receive_fiber_threads: 4,
            other_fiber_threads: 1,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            tcp_no_delay: true,
            reuse_address: true,
            listen_backlog: 1024,
            max_message_size: 1024 * 1024,
            tls: TlsSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Checks of this table alone
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid(problems))
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.bind_address.trim().is_empty() {
            problems.push("server.bind_address is empty".to_string());
        }
        if self.receive_fiber_threads == 0 {
            problems.push("server.receive_fiber_threads must be > 0".to_string());
        }
        if self.other_fiber_threads == 0 {
            problems.push("server.other_fiber_threads must be > 0".to_string());
        }
        if self.receive_buffer_size == 0 {
            problems.push("server.receive_buffer_size must be > 0".to_string());
        }
        if self.tls.enabled && self.tls.key_file.is_some() && self.tls.cert_file.is_none() {
            problems.push("server.tls.key_file given without cert_file".to_string());
        }
        problems
    }
}

/// TLS settings of a server
///
/// Without `cert_file` an ephemeral self-signed certificate is used.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    /// Private key; defaults to the certificate file
    pub key_file: Option<PathBuf>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub alpn: Vec<String>,
}

/// Settings of a client peer
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Delayed sends per second
    pub send_rate: u32,

    /// Timeout applied when a request does not name one
    pub default_timeout_secs: u64,

    /// Ping period feeding the RTT average (0 = no pings)
    pub ping_interval_ms: u64,

    /// RTT samples kept for the moving average
    pub max_rtt_samples: usize,

    pub receive_buffer_size: usize,
    pub tcp_no_delay: bool,
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            send_rate: 60,
            default_timeout_secs: 30,
            ping_interval_ms: 1000,
            max_rtt_samples: 20,
            receive_buffer_size: 8192,
            tcp_no_delay: true,
            connect_timeout_ms: 5000,
        }
    }
}

impl ClientSettings {
    /// Minimum spacing between delayed sends
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.send_rate.max(1)))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.send_rate == 0 {
            problems.push("client.send_rate must be > 0".to_string());
        }
        if self.max_rtt_samples == 0 {
            problems.push("client.max_rtt_samples must be > 0".to_string());
        }
        problems
    }
}

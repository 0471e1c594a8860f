//! RFC 6455 WebSocket support
//!
//! - `WebSocket` is the per-connection framing engine: handshake checks,
//!   frame encoding and incremental frame decoding
//! - `handshake` computes and generates the `Sec-WebSocket-*` keys
//! - `WsHandler` receives decoded messages and lifecycle events
//! - `WsClient` is a blocking client over any `SessionOps`
//!
//! Server-side sessions live in `crate::server::http`, which feeds socket
//! reads to a `WebSocket` after a successful upgrade.

pub mod client;
pub mod engine;
pub mod handshake;

pub use client::WsClient;
pub use engine::{encode_frame, Upgrade, WebSocket};

use crate::http::{HttpRequest, HttpResponse};

/// Result type for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,
}

/// Final fragment bit of the first header byte
pub const FIN: u8 = 0x80;

/// Mask bit of the second header byte
pub const MASK: u8 = 0x80;

/// Close status sent when none is given
pub const CLOSE_NORMAL: u16 = 1000;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Close, Ping and Pong
    pub fn is_control(&self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// WebSocket event hooks
///
/// Every hook has an empty default body.
pub trait WsHandler {
    /// Called with the validated upgrade request and the 101 response about
    /// to be sent (headers may still be added). Returning false rejects the
    /// upgrade.
    fn on_ws_connecting(&mut self, _request: &HttpRequest, _response: &mut HttpResponse) -> bool {
        true
    }

    /// Handshake completed
    fn on_ws_connected(&mut self, _request: &HttpRequest) {}

    /// A complete text or binary message
    fn on_ws_received(&mut self, _data: &[u8]) {}

    /// Close frame with its status (1000 when the peer sent none)
    fn on_ws_close(&mut self, _data: &[u8], _status: u16) {}

    fn on_ws_ping(&mut self, _data: &[u8]) {}

    fn on_ws_pong(&mut self, _data: &[u8]) {}

    fn on_ws_error(&mut self, _error: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        for opcode in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_u8(opcode.as_u8()), Some(opcode));
        }
        assert_eq!(Opcode::from_u8(0x3), None);
        assert!(Opcode::Ping.is_control());
        assert!(!Opcode::Binary.is_control());
    }
}

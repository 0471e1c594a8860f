//! Client-side operation pipeline
//!
//! A `ClientPeer` queues `OperationRequest`s, sends them over a
//! `PeerTransport` at a bounded rate, correlates responses by request id
//! and resolves requests that outlive their timeout with a synthetic
//! `OperationTimeout` response. Payloads are opaque bytes; serialising
//! them is left to the caller.
//!
//! ```text
//! send ──► delayed/immediate queue ──► sent ──► waiting ──► responded ──► callback
//!                                                   └──► timed out ──┘
//! ```

pub mod client;
pub mod codec;
pub mod pending;
pub mod transport;

pub use client::ClientPeer;
pub use codec::{FrameReader, Message};
pub use pending::OperationRequestPending;
pub use transport::{PeerTransport, TcpPeerTransport};

use bytes::Bytes;
use std::fmt;

/// Result type for peer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Peer errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::buffer::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Message of {0} bytes exceeds the limit")]
    MessageTooLarge(usize),

    #[error("Not connected")]
    NotConnected,
}

/// Operation code reserved for round-trip measurement
pub const PING_OPERATION_CODE: u16 = u16::MAX;

/// Outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0,
    Error = 1,
    OperationNotFound = 2,
    OperationInvalid = 3,
    OperationTimeout = 4,
    NotAuthorized = 5,
    MaxPendingRequest = 6,
    MaxRequestPerSecond = 7,
    InternalServerError = 8,
    NotConnected = 9,
}

impl ReturnCode {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReturnCode::Ok),
            1 => Some(ReturnCode::Error),
            2 => Some(ReturnCode::OperationNotFound),
            3 => Some(ReturnCode::OperationInvalid),
            4 => Some(ReturnCode::OperationTimeout),
            5 => Some(ReturnCode::NotAuthorized),
            6 => Some(ReturnCode::MaxPendingRequest),
            7 => Some(ReturnCode::MaxRequestPerSecond),
            8 => Some(ReturnCode::InternalServerError),
            9 => Some(ReturnCode::NotConnected),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a request leaves the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendParameters {
    /// Sent ahead of queued delayed requests
    pub immediate: bool,
    pub encrypted: bool,
    pub reliable: bool,
}

impl Default for SendParameters {
    fn default() -> Self {
        SendParameters {
            immediate: false,
            encrypted: false,
            reliable: true,
        }
    }
}

impl SendParameters {
    pub fn immediate() -> Self {
        SendParameters {
            immediate: true,
            ..Self::default()
        }
    }
}

/// One RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation_code: u16,
    /// Assigned by the client when the request is queued
    pub request_id: u16,
    pub payload: Bytes,
    pub encrypted: bool,
}

impl OperationRequest {
    pub fn new(operation_code: u16, payload: impl Into<Bytes>) -> Self {
        OperationRequest {
            operation_code,
            request_id: 0,
            payload: payload.into(),
            encrypted: false,
        }
    }

    pub fn is_ping(&self) -> bool {
        self.operation_code == PING_OPERATION_CODE
    }
}

/// Answer to an `OperationRequest`, matched by `request_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub operation_code: u16,
    pub request_id: u16,
    pub return_code: ReturnCode,
    pub debug_message: Option<String>,
    pub payload: Bytes,
}

impl OperationResponse {
    /// Empty response correlated with `request`
    pub fn for_request(request: &OperationRequest, return_code: ReturnCode) -> Self {
        OperationResponse {
            operation_code: request.operation_code,
            request_id: request.request_id,
            return_code,
            debug_message: None,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_debug_message(mut self, message: impl Into<String>) -> Self {
        self.debug_message = Some(message.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == ReturnCode::Ok
    }
}

/// Server-initiated message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    pub event_code: u16,
    pub payload: Bytes,
}

impl OperationEvent {
    pub fn new(event_code: u16, payload: impl Into<Bytes>) -> Self {
        OperationEvent {
            event_code,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        for value in 0..=9u8 {
            let code = ReturnCode::from_u8(value).unwrap();
            assert_eq!(code.as_u8(), value);
        }
        assert_eq!(ReturnCode::from_u8(10), None);
        assert_eq!(ReturnCode::MaxRequestPerSecond.to_string(), "MaxRequestPerSecond");
    }

    #[test]
    fn test_response_for_request() {
        let mut request = OperationRequest::new(7, &b"abc"[..]);
        request.request_id = 42;

        let response = OperationResponse::for_request(&request, ReturnCode::OperationTimeout)
            .with_debug_message("too slow");
        assert_eq!(response.operation_code, 7);
        assert_eq!(response.request_id, 42);
        assert!(!response.is_ok());
        assert_eq!(response.debug_message.as_deref(), Some("too slow"));
        assert!(response.payload.is_empty());
    }
}

//! Binary operation framing
//!
//! Every message is `[u32 length][u8 kind][body]`, big-endian, where
//! `length` counts the kind byte and the body:
//!
//! | kind | body |
//! |---|---|
//! | 1 request  | `u16 operation, u16 request id, u8 flags, payload` |
//! | 2 response | `u16 operation, u16 request id, u8 return code, u16 debug length, debug, payload` |
//! | 3 event    | `u16 event code, payload` |
//!
//! Stream transports feed reads into a `FrameReader`; datagram transports
//! carry exactly one frame per packet.

use super::{Error, OperationEvent, OperationRequest, OperationResponse, Result, ReturnCode};
use crate::buffer::MemoryBuffer;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length prefix size
pub const LENGTH_SIZE: usize = 4;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_EVENT: u8 = 3;

const FLAG_ENCRYPTED: u8 = 0x01;

/// Any message on the operation channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(OperationRequest),
    Response(OperationResponse),
    Event(OperationEvent),
}

/// Encode a message including its length prefix
pub fn encode(message: &Message) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    match message {
        Message::Request(request) => {
            body.put_u8(KIND_REQUEST);
            body.put_u16(request.operation_code);
            body.put_u16(request.request_id);
            body.put_u8(if request.encrypted { FLAG_ENCRYPTED } else { 0 });
            body.put_slice(&request.payload);
        }
        Message::Response(response) => {
            let debug = response.debug_message.as_deref().unwrap_or("").as_bytes();
            let debug = &debug[..debug.len().min(u16::MAX as usize)];
            body.put_u8(KIND_RESPONSE);
            body.put_u16(response.operation_code);
            body.put_u16(response.request_id);
            body.put_u8(response.return_code.as_u8());
            body.put_u16(debug.len() as u16);
            body.put_slice(debug);
            body.put_slice(&response.payload);
        }
        Message::Event(event) => {
            body.put_u8(KIND_EVENT);
            body.put_u16(event.event_code);
            body.put_slice(&event.payload);
        }
    }

    let mut frame = BytesMut::with_capacity(LENGTH_SIZE + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    frame.freeze()
}

/// Decode one message body (kind byte onwards, no length prefix)
pub fn decode(mut body: &[u8]) -> Result<Message> {
    if body.is_empty() {
        return Err(Error::Codec("empty message".into()));
    }

    match body.get_u8() {
        KIND_REQUEST => {
            need(body, 5, "request")?;
            let operation_code = body.get_u16();
            let request_id = body.get_u16();
            let flags = body.get_u8();
            Ok(Message::Request(OperationRequest {
                operation_code,
                request_id,
                payload: Bytes::copy_from_slice(body),
                encrypted: flags & FLAG_ENCRYPTED != 0,
            }))
        }
        KIND_RESPONSE => {
            need(body, 7, "response")?;
            let operation_code = body.get_u16();
            let request_id = body.get_u16();
            let code = body.get_u8();
            let return_code = ReturnCode::from_u8(code)
                .ok_or_else(|| Error::Codec(format!("unknown return code {}", code)))?;
            let debug_len = body.get_u16() as usize;
            need(body, debug_len, "debug message")?;
            let debug_message = (debug_len > 0)
                .then(|| String::from_utf8_lossy(&body[..debug_len]).into_owned());
            body.advance(debug_len);
            Ok(Message::Response(OperationResponse {
                operation_code,
                request_id,
                return_code,
                debug_message,
                payload: Bytes::copy_from_slice(body),
            }))
        }
        KIND_EVENT => {
            need(body, 2, "event")?;
            let event_code = body.get_u16();
            Ok(Message::Event(OperationEvent {
                event_code,
                payload: Bytes::copy_from_slice(body),
            }))
        }
        kind => Err(Error::Codec(format!("unknown message kind {}", kind))),
    }
}

/// Decode a datagram holding exactly one length-prefixed frame
pub fn decode_frame(mut frame: &[u8]) -> Result<Message> {
    need(frame, LENGTH_SIZE, "length prefix")?;
    let length = frame.get_u32() as usize;
    if frame.len() != length {
        return Err(Error::Codec(format!(
            "frame declares {} bytes, carries {}",
            length,
            frame.len()
        )));
    }
    decode(frame)
}

fn need(buf: &[u8], size: usize, what: &str) -> Result<()> {
    if buf.len() < size {
        return Err(Error::Codec(format!("truncated {}", what)));
    }
    Ok(())
}

/// Reassembles frames from arbitrarily split stream reads
#[derive(Debug)]
pub struct FrameReader {
    buffer: MemoryBuffer,
    max_message_size: usize,
}

impl FrameReader {
    pub fn new(max_message_size: usize) -> Self {
        FrameReader {
            buffer: MemoryBuffer::with_capacity(4096),
            max_message_size,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.write(data);
    }

    /// Bytes held but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message, if one is buffered
    ///
    /// A length above the limit is an error; the connection should be
    /// dropped since the stream can no longer be resynchronised.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let mut header = self.buffer.as_slice();
        if header.len() < LENGTH_SIZE {
            return Ok(None);
        }
        let length = header.get_u32() as usize;
        if length > self.max_message_size {
            return Err(Error::MessageTooLarge(length));
        }
        let total = LENGTH_SIZE + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let message = decode(&self.buffer.as_slice()[LENGTH_SIZE..total]);
        self.buffer.remove(0, total)?;
        message.map(Some)
    }
}

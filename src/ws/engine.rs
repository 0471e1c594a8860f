//! WebSocket framing engine
//!
//! One `WebSocket` per connection. Incoming bytes may arrive in any split:
//! the raw frame (header included) is accumulated in `receive_frame` until
//! it is complete, then its unmasked payload is appended to
//! `receive_final`, which collects the fragments of one message.
//!
//! A frame whose payload, or a message whose fragments, would exceed
//! `max_message_size` is reported through `WsHandler::on_ws_error` as soon
//! as its header is decoded; the payload is never buffered.

use super::handshake::{self, WS_VERSION};
use super::{Error, Opcode, Result, WsHandler, CLOSE_NORMAL, FIN, MASK};
use crate::buffer::MemoryBuffer;
use crate::http::{HttpRequest, HttpResponse};
use bytes::{Buf, BufMut};
use rand::Rng;

/// Outcome of a server-side upgrade attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// Not a WebSocket request; serve it as plain HTTP
    NotRequested,
    /// Invalid or vetoed; the response holds the error to send
    Rejected,
    /// The response holds the 101 to send
    Accepted,
}

/// Encode one frame into `out`
///
/// Close frames with a status or a payload carry the 2-byte big-endian
/// status first; it is masked together with the payload.
pub fn encode_frame(
    out: &mut Vec<u8>,
    opcode: Opcode,
    fin: bool,
    mask: Option<[u8; 4]>,
    payload: &[u8],
    status: u16,
) {
    let with_status = opcode == Opcode::Close && (status != 0 || !payload.is_empty());
    let size = payload.len() + if with_status { 2 } else { 0 };
    let mask_bit = if mask.is_some() { MASK } else { 0 };

    out.reserve(size + 14);
    out.put_u8(if fin { FIN } else { 0 } | opcode.as_u8());
    if size <= 125 {
        out.put_u8(size as u8 | mask_bit);
    } else if size <= 0xFFFF {
        out.put_u8(126 | mask_bit);
        out.put_u16(size as u16);
    } else {
        out.put_u8(127 | mask_bit);
        out.put_u64(size as u64);
    }

    let start = out.len() + if mask.is_some() { 4 } else { 0 };
    if let Some(key) = mask {
        out.put_slice(&key);
    }
    if with_status {
        out.put_u16(status);
    }
    out.put_slice(payload);

    if let Some(key) = mask {
        for (i, byte) in out[start..].iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
}

/// Per-connection WebSocket state
#[derive(Debug, Clone)]
pub struct WebSocket {
    client: bool,
    handshaked: bool,
    key: String,
    send_buffer: Vec<u8>,
    max_message_size: usize,

    opcode: u8,
    frame_received: bool,
    final_received: bool,
    header_size: usize,
    payload_size: usize,
    receive_mask: [u8; 4],
    receive_frame: MemoryBuffer,
    receive_final: MemoryBuffer,
}

impl WebSocket {
    /// Engine for the accepting side (sends unmasked frames)
    pub fn server() -> Self {
        Self::new(false)
    }

    /// Engine for the connecting side (masks every frame)
    pub fn client() -> Self {
        Self::new(true)
    }

    fn new(client: bool) -> Self {
        WebSocket {
            client,
            handshaked: false,
            key: String::new(),
            send_buffer: Vec::new(),
            max_message_size: usize::MAX,
            opcode: 0,
            frame_received: false,
            final_received: false,
            header_size: 0,
            payload_size: 0,
            receive_mask: [0; 4],
            receive_frame: MemoryBuffer::new(),
            receive_final: MemoryBuffer::new(),
        }
    }

    /// Limit for one frame payload and for one reassembled message
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked
    }

    /// Forget the handshake and any partial frame
    pub fn clear(&mut self) {
        self.handshaked = false;
        self.key.clear();
        self.send_buffer.clear();
        self.opcode = 0;
        self.reset_frame();
        self.final_received = false;
        self.receive_final.clear();
    }

    /// Validate an upgrade request and prepare the answer in `response`
    pub fn perform_server_upgrade<H: WsHandler + ?Sized>(
        &mut self,
        request: &HttpRequest,
        response: &mut HttpResponse,
        handler: &mut H,
    ) -> Upgrade {
        if request.method() != "GET" {
            return Upgrade::NotRequested;
        }

        let mut error = false;
        let mut connection = false;
        let mut upgrade = false;
        let mut version = false;
        let mut accept = None;

        for (name, value) in request.headers().iter() {
            if name.eq_ignore_ascii_case("Connection") {
                if handshake::is_upgrade_connection(value) {
                    connection = true;
                } else {
                    error = true;
                }
            } else if name.eq_ignore_ascii_case("Upgrade") {
                if value.eq_ignore_ascii_case("websocket") {
                    upgrade = true;
                } else {
                    error = true;
                }
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                if value.is_empty() {
                    error = true;
                } else {
                    accept = Some(handshake::accept_key(value));
                }
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
                if value == WS_VERSION {
                    version = true;
                } else {
                    error = true;
                }
            }
        }

        if !connection && !upgrade && !version && accept.is_none() {
            return Upgrade::NotRequested;
        }

        let accept = match accept {
            Some(accept) if connection && upgrade && version && !error => accept,
            _ => {
                response.make_error_response(400, "Invalid WebSocket handshake request");
                return Upgrade::Rejected;
            }
        };

        response
            .set_begin(101)
            .set_header("Connection", "Upgrade")
            .set_header("Upgrade", "websocket")
            .set_header("Sec-WebSocket-Accept", &accept);

        if !handler.on_ws_connecting(request, response) {
            response.make_error_response(403, "WebSocket upgrade rejected");
            return Upgrade::Rejected;
        }

        response.set_body(&[]);
        self.handshaked = true;
        Upgrade::Accepted
    }

    /// Compose the client upgrade request with a fresh key
    pub fn make_client_upgrade_request(&mut self, request: &mut HttpRequest, host: &str, path: &str) {
        self.key = handshake::generate_key();
        request
            .set_begin("GET", path)
            .set_header("Host", host)
            .set_header("Upgrade", "websocket")
            .set_header("Connection", "Upgrade")
            .set_header("Sec-WebSocket-Key", &self.key)
            .set_header("Sec-WebSocket-Version", WS_VERSION)
            .set_body(&[]);
    }

    /// Validate the server's answer to `make_client_upgrade_request`
    pub fn perform_client_upgrade(&mut self, response: &HttpResponse) -> Result<()> {
        if response.status() != 101 {
            return Err(Error::Handshake(format!(
                "unexpected status {} {}",
                response.status(),
                response.status_phrase()
            )));
        }

        let connection = response
            .header("Connection")
            .is_some_and(handshake::is_upgrade_connection);
        let upgrade = response
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !connection || !upgrade {
            return Err(Error::Handshake("missing upgrade headers".into()));
        }

        let expected = handshake::accept_key(&self.key);
        match response.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == expected => {
                self.handshaked = true;
                Ok(())
            }
            _ => Err(Error::Handshake("Sec-WebSocket-Accept mismatch".into())),
        }
    }

    /// Encode one frame into the send buffer
    ///
    /// With `mask`, a fresh random mask is drawn for this frame.
    pub fn prepare_send_frame(
        &mut self,
        opcode: Opcode,
        fin: bool,
        mask: bool,
        payload: &[u8],
        status: u16,
    ) -> &[u8] {
        let key = mask.then(|| {
            let mut key = [0u8; 4];
            rand::thread_rng().fill(&mut key[..]);
            key
        });
        self.send_buffer.clear();
        encode_frame(&mut self.send_buffer, opcode, fin, key, payload, status);
        &self.send_buffer
    }

    /// Single-frame message, masked when this is a client engine
    pub fn prepare_message(&mut self, opcode: Opcode, payload: &[u8]) -> &[u8] {
        let mask = self.client;
        self.prepare_send_frame(opcode, true, mask, payload, 0)
    }

    /// Feed received bytes, dispatching every completed frame
    pub fn prepare_receive_frame<H: WsHandler + ?Sized>(&mut self, mut data: &[u8], handler: &mut H) {
        while !data.is_empty() {
            if self.frame_received {
                self.reset_frame();
            }
            if self.final_received {
                self.final_received = false;
                self.receive_final.clear();
            }

            data = self.fill_frame(data, 2);
            if self.receive_frame.len() < 2 {
                break;
            }

            let first = self.receive_frame[0];
            let second = self.receive_frame[1];
            let masked = second & MASK != 0;
            let length_field = second & 0x7F;
            let extended = match length_field {
                126 => 2,
                127 => 8,
                _ => 0,
            };
            self.header_size = 2 + extended + if masked { 4 } else { 0 };

            data = self.fill_frame(data, self.header_size);
            if self.receive_frame.len() < self.header_size {
                break;
            }

            let mut header = &self.receive_frame.as_slice()[2..self.header_size];
            let length = match extended {
                2 => u64::from(header.get_u16()),
                8 => header.get_u64(),
                _ => u64::from(length_field),
            };
            self.receive_mask = [0; 4];
            if masked {
                header.copy_to_slice(&mut self.receive_mask);
            }

            let total = match usize::try_from(length)
                .ok()
                .and_then(|len| len.checked_add(self.header_size))
            {
                Some(total) => total,
                None => {
                    handler.on_ws_error(&format!("frame length {} is not addressable", length));
                    self.reset_frame();
                    return;
                }
            };
            self.payload_size = total - self.header_size;

            // Control frames are never appended to the message
            let message_size = if first & 0x08 == 0 {
                self.receive_final.len().saturating_add(self.payload_size)
            } else {
                self.payload_size
            };
            if message_size > self.max_message_size {
                handler.on_ws_error(&format!(
                    "message of {} bytes exceeds the limit of {}",
                    message_size, self.max_message_size
                ));
                self.reset_frame();
                self.opcode = 0;
                self.receive_final.clear();
                return;
            }

            data = self.fill_frame(data, total);
            if self.receive_frame.len() < total {
                break;
            }

            self.frame_received = true;
            self.complete_frame(first, handler);
        }
    }

    fn complete_frame<H: WsHandler + ?Sized>(&mut self, first: u8, handler: &mut H) {
        let start = self.header_size;
        let end = start + self.payload_size;
        let mask = self.receive_mask;
        for (i, byte) in self.receive_frame.as_mut_slice()[start..end].iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
        let payload = &self.receive_frame.as_slice()[start..end];

        let frame_opcode = first & 0x0F;
        match Opcode::from_u8(frame_opcode) {
            Some(Opcode::Ping) => handler.on_ws_ping(payload),
            Some(Opcode::Pong) => handler.on_ws_pong(payload),
            Some(Opcode::Close) => {
                let (status, data) = if payload.len() >= 2 {
                    let mut status = &payload[..2];
                    (status.get_u16(), &payload[2..])
                } else {
                    (CLOSE_NORMAL, payload)
                };
                handler.on_ws_close(data, status);
            }
            Some(_) => {
                if frame_opcode != 0 {
                    self.opcode = frame_opcode;
                }
                self.receive_final.write(payload);

                if first & FIN != 0 {
                    self.final_received = true;
                    match Opcode::from_u8(self.opcode) {
                        Some(Opcode::Text) | Some(Opcode::Binary) => {
                            handler.on_ws_received(self.receive_final.as_slice())
                        }
                        _ => handler.on_ws_error("continuation frame without a message"),
                    }
                }
            }
            None => handler.on_ws_error(&format!("unknown opcode {:#x}", frame_opcode)),
        }
    }

    /// Move bytes from `data` into the frame buffer until it holds `target`
    fn fill_frame<'a>(&mut self, data: &'a [u8], target: usize) -> &'a [u8] {
        let missing = target.saturating_sub(self.receive_frame.len());
        let take = missing.min(data.len());
        self.receive_frame.write(&data[..take]);
        &data[take..]
    }

    fn reset_frame(&mut self) {
        self.frame_received = false;
        self.header_size = 0;
        self.payload_size = 0;
        self.receive_mask = [0; 4];
        self.receive_frame.clear();
    }
}

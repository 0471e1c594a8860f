//! ProtonNet - request/response networking for game and application servers
//!
//! The crate is split along the wire:
//!
//! - [`buffer`]: growable byte buffer shared by every parser
//! - [`http`]: incremental HTTP/1.1 request and response parsing, blocking
//!   client, TLS transport
//! - [`ws`]: WebSocket handshake and framing engine, blocking client
//! - [`peer`]: client-side operation pipeline (`ClientPeer`) and its
//!   binary message codec
//! - [`server`]: TCP, TLS, UDP, HTTP and WebSocket servers with request
//!   admission and worker fibers
//! - [`stats`]: byte, packet and session counters
//! - [`config`], [`logging`]: TOML settings and tracing setup

pub mod buffer;
pub mod config;
pub mod http;
pub mod logging;
pub mod peer;
pub mod server;
pub mod stats;
pub mod ws;

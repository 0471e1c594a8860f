//! UDP server
//!
//! One receive thread per socket. Each remote address gets a session the
//! first time it sends a datagram; `on_received` sees whole datagrams.
//! Datagram peers never signal a disconnect, so sessions live until the
//! server stops or something calls `Session::disconnect`.

use super::session::{DatagramSink, Session};
use super::socket::{bind_addr, on_other_fiber, ServerContext, SocketServer, SocketService, POLL_INTERVAL};
use super::{Error, Result};
use dashmap::DashMap;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpServer {
    context: Arc<ServerContext>,
    service: Arc<dyn SocketService>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    pub fn new(settings: crate::config::ServerSettings, service: Arc<dyn SocketService>) -> Result<Self> {
        Ok(UdpServer {
            context: Arc::new(ServerContext::new(settings)?),
            service,
            receiver: Mutex::new(None),
        })
    }

    fn bind(&self) -> Result<UdpSocket> {
        let settings = self.context.settings();
        let addr = bind_addr(settings)?;
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(settings.reuse_address)?;
        if settings.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(settings.receive_buffer_size)?;
        }
        if settings.send_buffer_size > 0 {
            socket.set_send_buffer_size(settings.send_buffer_size)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(socket.into())
    }
}

/// Session of `remote`, opening a new one if it has none or it was closed
fn peer_session(
    ctx: &Arc<ServerContext>,
    service: &Arc<dyn SocketService>,
    socket: &Arc<UdpSocket>,
    peers: &DashMap<SocketAddr, Arc<Session>>,
    remote: SocketAddr,
) -> Arc<Session> {
    if let Some(session) = peers.get(&remote) {
        if session.is_connected() {
            return Arc::clone(session.value());
        }
    }

    if let Some((_, stale)) = peers.remove(&remote) {
        close_peer(ctx, service, &stale);
    }

    let session = ctx.open_session(remote, Box::new(DatagramSink::new(Arc::clone(socket), remote)));
    peers.insert(remote, Arc::clone(&session));
    let service = Arc::clone(service);
    let opened = Arc::clone(&session);
    on_other_fiber(ctx, move |ctx| service.on_connected(ctx, &opened));
    session
}

fn close_peer(ctx: &Arc<ServerContext>, service: &Arc<dyn SocketService>, session: &Arc<Session>) {
    session.disconnect();
    ctx.close_session(session.id());
    let service = Arc::clone(service);
    let session = Arc::clone(session);
    on_other_fiber(ctx, move |ctx| service.on_disconnected(ctx, &session));
}

fn receive_loop(ctx: Arc<ServerContext>, service: Arc<dyn SocketService>, socket: Arc<UdpSocket>) {
    let peers: DashMap<SocketAddr, Arc<Session>> = DashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while ctx.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((n, remote)) => {
                ctx.statistics().add_received(n);
                let session = peer_session(&ctx, &service, &socket, &peers, remote);
                service.on_received(&ctx, &session, &buf[..n]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            // ICMP port unreachable from an earlier send
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
            Err(error) => {
                tracing::error!(parent: ctx.span(), %error, "UDP receive failed");
                break;
            }
        }
    }

    let sessions: Vec<_> = peers.iter().map(|p| Arc::clone(p.value())).collect();
    for session in sessions {
        close_peer(&ctx, &service, &session);
    }
}

impl SocketServer for UdpServer {
    fn start(&self) -> Result<()> {
        let socket = Arc::new(self.bind()?);
        if !self.context.begin(socket.local_addr()?) {
            return Err(Error::AlreadyStarted(self.context.name().to_string()));
        }

        let ctx = Arc::clone(&self.context);
        let service = Arc::clone(&self.service);
        let spawned = thread::Builder::new()
            .name(format!("{}-udp", self.context.name()))
            .spawn(move || receive_loop(ctx, service, socket));

        match spawned {
            Ok(handle) => {
                *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(error) => {
                self.context.end();
                Err(error.into())
            }
        }
    }

    fn stop(&self) {
        if !self.context.end() {
            return;
        }
        let handle = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.context.disconnect_all();
    }

    fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

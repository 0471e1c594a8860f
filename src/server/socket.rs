//! Socket servers
//!
//! `ServerContext` is shared by a server's threads. `SocketService` is the
//! application side of a TCP, TLS, UDP or WebSocket server;
//! `OperationService` implements it for the binary operation protocol.

use super::admission::RequestAdmission;
use super::fiber::Fiber;
use super::session::{Session, SessionSink, StreamSink};
use super::{Error, Result, SessionId};
use crate::config::ServerSettings;
use crate::http::session::{poll_fd, FdSessionOps, PollEvents};
use crate::http::tls::TlsConfig;
use crate::http::SessionOps;
use crate::peer::codec::{FrameReader, Message};
use crate::peer::{OperationRequest, OperationResponse, ReturnCode};
use crate::stats::NetworkStatistics;
use dashmap::DashMap;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Span;

/// How long blocking loops wait before re-checking for shutdown
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running transport
pub trait SocketServer: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Stop accepting, disconnect every session and wait for the I/O loop
    fn stop(&self);

    fn context(&self) -> &Arc<ServerContext>;

    fn network_statistics(&self) -> Arc<NetworkStatistics> {
        Arc::clone(self.context().statistics())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.context().local_addr()
    }
}

/// State shared by one server's threads
pub struct ServerContext {
    settings: ServerSettings,
    span: Span,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_session_id: AtomicU64,
    statistics: Arc<NetworkStatistics>,
    admission: RequestAdmission,
    received_fiber: Fiber,
    other_fiber: Fiber,
}

impl ServerContext {
    pub fn new(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        let span = tracing::info_span!("server", name = %settings.name);
        let received_fiber = Fiber::new(
            &format!("{}-received", settings.name),
            settings.receive_fiber_threads,
        )?;
        let other_fiber = Fiber::new(&format!("{}-other", settings.name), settings.other_fiber_threads)?;

        Ok(ServerContext {
            admission: RequestAdmission::from_settings(&settings),
            span,
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            statistics: Arc::new(NetworkStatistics::new()),
            received_fiber,
            other_fiber,
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Parent span for every event this server logs
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    pub fn admission(&self) -> &RequestAdmission {
        &self.admission
    }

    pub fn received_fiber(&self) -> &Fiber {
        &self.received_fiber
    }

    pub fn other_fiber(&self) -> &Fiber {
        &self.other_fiber
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Mark the server running; false if it already was
    pub(crate) fn begin(&self, local_addr: SocketAddr) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.local_addr) = Some(local_addr);
        tracing::info!(parent: &self.span, %local_addr, "server started");
        true
    }

    /// Mark the server stopped; false if it was not running
    pub(crate) fn end(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(parent: &self.span, "server stopped");
        true
    }

    pub(crate) fn open_session(&self, remote_addr: SocketAddr, sink: Box<dyn SessionSink>) -> Arc<Session> {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, remote_addr, sink, Arc::clone(&self.statistics)));
        self.sessions.insert(id, Arc::clone(&session));
        self.statistics.add_session_connected();
        tracing::debug!(parent: &self.span, session = %id, %remote_addr, "session connected");
        session
    }

    pub(crate) fn close_session(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            self.admission.remove_session(id);
            self.statistics.add_session_disconnected();
            tracing::debug!(parent: &self.span, session = %id, "session disconnected");
        }
    }

    /// Disconnect every session; their I/O loops finish on their own
    pub fn disconnect_all(&self) {
        for session in self.sessions() {
            session.disconnect();
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("name", &self.settings.name)
            .field("local_addr", &self.local_addr())
            .field("running", &self.is_running())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Application side of a socket server
///
/// `on_received` runs on the session's I/O thread, in arrival order. The
/// other hooks run on the context's `other` fiber.
pub trait SocketService: Send + Sync + 'static {
    fn on_connected(&self, _ctx: &Arc<ServerContext>, _session: &Arc<Session>) {}

    fn on_received(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, data: &[u8]);

    fn on_disconnected(&self, _ctx: &Arc<ServerContext>, _session: &Arc<Session>) {}

    fn on_error(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, error: &io::Error) {
        tracing::warn!(parent: ctx.span(), session = %session.id(), %error, "session error");
    }
}

/// Run `f` on the `other` fiber
pub(crate) fn on_other_fiber(ctx: &Arc<ServerContext>, f: impl FnOnce(&Arc<ServerContext>) + Send + 'static) {
    let job_ctx = Arc::clone(ctx);
    if !ctx.other_fiber().enqueue(move || f(&job_ctx)) {
        tracing::debug!(parent: ctx.span(), "other fiber stopped, callback dropped");
    }
}

/// Operation handler, run on the `received` fiber
pub type OperationHandler = Arc<dyn Fn(&OperationRequest, &Arc<Session>) -> OperationResponse + Send + Sync>;

/// Binary operation protocol on top of any socket server
///
/// Pings are answered on the I/O thread without admission. Other requests
/// pass the admission gates, then run their handler on the `received`
/// fiber; a panicking handler yields `InternalServerError`.
#[derive(Default)]
pub struct OperationService {
    handlers: HashMap<u16, OperationHandler>,
    readers: DashMap<SessionId, FrameReader>,
}

impl OperationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of one operation code
    pub fn register(
        &mut self,
        operation_code: u16,
        handler: impl Fn(&OperationRequest, &Arc<Session>) -> OperationResponse + Send + Sync + 'static,
    ) -> &mut Self {
        self.handlers.insert(operation_code, Arc::new(handler));
        self
    }

    pub fn has_handler(&self, operation_code: u16) -> bool {
        self.handlers.contains_key(&operation_code)
    }

    fn handle_request(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, request: OperationRequest) {
        if request.is_ping() {
            let pong = OperationResponse::for_request(&request, ReturnCode::Ok).with_payload(request.payload.clone());
            reply(ctx, session, pong);
            return;
        }

        let guard = match ctx.admission().try_admit(session.id()) {
            Ok(guard) => guard,
            Err(rejection) => {
                tracing::warn!(
                    parent: ctx.span(),
                    session = %session.id(),
                    operation_code = request.operation_code,
                    %rejection,
                    "operation request rejected"
                );
                reply(ctx, session, OperationResponse::for_request(&request, rejection.return_code()));
                return;
            }
        };

        let Some(handler) = self.handlers.get(&request.operation_code).cloned() else {
            reply(
                ctx,
                session,
                OperationResponse::for_request(&request, ReturnCode::OperationNotFound),
            );
            return;
        };

        let job_ctx = Arc::clone(ctx);
        let job_session = Arc::clone(session);
        let queued = ctx.received_fiber().enqueue(move || {
            let _guard = guard;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&request, &job_session)));
            let response = match outcome {
                Ok(mut response) => {
                    response.operation_code = request.operation_code;
                    response.request_id = request.request_id;
                    response
                }
                Err(_) => {
                    tracing::error!(
                        parent: job_ctx.span(),
                        session = %job_session.id(),
                        operation_code = request.operation_code,
                        "operation handler panicked"
                    );
                    OperationResponse::for_request(&request, ReturnCode::InternalServerError)
                }
            };
            reply(&job_ctx, &job_session, response);
        });
        if !queued {
            tracing::debug!(parent: ctx.span(), "received fiber stopped, request dropped");
        }
    }
}

fn reply(ctx: &ServerContext, session: &Session, response: OperationResponse) {
    if let Err(error) = session.send_message(&Message::Response(response)) {
        tracing::debug!(parent: ctx.span(), session = %session.id(), %error, "response not delivered");
    }
}

impl SocketService for OperationService {
    fn on_connected(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>) {
        tracing::trace!(parent: ctx.span(), session = %session.id(), "operation session open");
    }

    fn on_received(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, data: &[u8]) {
        let mut messages = Vec::new();
        let failure = {
            let mut reader = self
                .readers
                .entry(session.id())
                .or_insert_with(|| FrameReader::new(ctx.settings().max_message_size));
            reader.push(data);
            loop {
                match reader.next_message() {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                }
            }
        };

        for message in messages {
            match message {
                Message::Request(request) => self.handle_request(ctx, session, request),
                Message::Response(_) | Message::Event(_) => tracing::debug!(
                    parent: ctx.span(),
                    session = %session.id(),
                    "ignoring non-request message from client"
                ),
            }
        }

        if let Some(error) = failure {
            tracing::warn!(parent: ctx.span(), session = %session.id(), %error, "malformed operation stream");
            self.readers.remove(&session.id());
            session.disconnect();
        }
    }

    fn on_disconnected(&self, _ctx: &Arc<ServerContext>, session: &Arc<Session>) {
        self.readers.remove(&session.id());
    }
}

/// Parse the configured bind address
pub(crate) fn bind_addr(settings: &ServerSettings) -> Result<SocketAddr> {
    settings
        .bind_address
        .parse()
        .map_err(|_| Error::InvalidAddress(settings.bind_address.clone()))
}

/// Listening socket with the configured options
pub(crate) fn bind_listener(settings: &ServerSettings) -> Result<TcpListener> {
    let addr = bind_addr(settings)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(settings.reuse_address)?;
    if settings.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(settings.receive_buffer_size)?;
    }
    if settings.send_buffer_size > 0 {
        socket.set_send_buffer_size(settings.send_buffer_size)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(settings.listen_backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Accept until the context stops, handing each connection to `on_accept`
pub(crate) fn spawn_acceptor(
    ctx: &Arc<ServerContext>,
    listener: TcpListener,
    on_accept: impl Fn(TcpStream, SocketAddr) + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name(format!("{}-accept", ctx.name()))
        .spawn(move || {
            let fd = listener.as_raw_fd();
            while ctx.is_running() {
                match poll_fd(fd, PollEvents::Read, Some(POLL_INTERVAL)) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(error) => {
                        tracing::error!(parent: ctx.span(), %error, "listener poll failed");
                        break;
                    }
                }
                match listener.accept() {
                    Ok((stream, remote)) => {
                        let configured = stream
                            .set_nonblocking(false)
                            .and_then(|_| stream.set_nodelay(ctx.settings().tcp_no_delay));
                        match configured {
                            Ok(()) => on_accept(stream, remote),
                            Err(error) => {
                                tracing::warn!(parent: ctx.span(), %remote, %error, "socket setup failed")
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(error) => tracing::warn!(parent: ctx.span(), %error, "accept failed"),
                }
            }
        })
}

/// Per-connection callbacks of a stream session loop
pub(crate) trait StreamHandler: Send {
    fn on_open(&mut self, session: &Arc<Session>);

    /// Returns false to close the connection
    fn on_data(&mut self, session: &Arc<Session>, data: &[u8]) -> bool;

    fn on_error(&mut self, session: &Arc<Session>, error: io::Error);

    fn on_close(&mut self, session: &Arc<Session>);
}

enum ReadOutcome {
    Data(usize),
    Idle,
    Closed,
}

fn to_io(error: crate::http::Error) -> io::Error {
    match error {
        crate::http::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn read_some<S: SessionOps>(ops: &Mutex<S>, fd: RawFd, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let buffered = lock(ops).pending() > 0;
    if !buffered && !poll_fd(fd, PollEvents::Read, Some(POLL_INTERVAL)).map_err(to_io)? {
        return Ok(ReadOutcome::Idle);
    }
    let n = lock(ops).read(buf).map_err(to_io)?;
    Ok(if n == 0 {
        ReadOutcome::Closed
    } else {
        ReadOutcome::Data(n)
    })
}

/// Drive one stream connection until either side closes it
pub(crate) fn run_stream_session<S, H>(ctx: &Arc<ServerContext>, ops: S, remote: SocketAddr, mut handler: H)
where
    S: SessionOps + Send + 'static,
    H: StreamHandler,
{
    let fd = ops.raw_fd();
    let ops = Arc::new(Mutex::new(ops));
    let session = ctx.open_session(remote, Box::new(StreamSink::new(Arc::clone(&ops))));
    handler.on_open(&session);

    let mut buf = vec![0u8; ctx.settings().receive_buffer_size.max(512)];
    while session.is_connected() && ctx.is_running() {
        match read_some(&ops, fd, &mut buf) {
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Closed) => break,
            Ok(ReadOutcome::Data(n)) => {
                ctx.statistics().add_received(n);
                if !handler.on_data(&session, &buf[..n]) {
                    break;
                }
            }
            Err(error) => {
                if session.is_connected() {
                    handler.on_error(&session, error);
                }
                break;
            }
        }
    }

    session.disconnect();
    ctx.close_session(session.id());
    handler.on_close(&session);
}

/// Spawn the thread of one accepted connection, with optional TLS
pub(crate) fn spawn_stream<H>(
    ctx: &Arc<ServerContext>,
    tls: Option<TlsConfig>,
    stream: TcpStream,
    remote: SocketAddr,
    handler: H,
) where
    H: StreamHandler + 'static,
{
    let thread_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("{}-session", ctx.name()))
        .spawn(move || {
            let ctx = thread_ctx;
            match tls {
                Some(config) => match config.accept(stream) {
                    Ok(ops) => run_stream_session(&ctx, ops, remote, handler),
                    Err(error) => {
                        tracing::warn!(parent: ctx.span(), %remote, %error, "TLS handshake failed")
                    }
                },
                None => run_stream_session(&ctx, FdSessionOps::new(stream), remote, handler),
            }
        });
    if let Err(error) = spawned {
        tracing::error!(parent: ctx.span(), %remote, %error, "cannot spawn session thread");
    }
}

/// Acceptor thread of a stream server
pub(crate) struct StreamListener {
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl StreamListener {
    pub(crate) fn new() -> Self {
        StreamListener {
            acceptor: Mutex::new(None),
        }
    }

    /// Bind, mark `ctx` running and serve each connection with a fresh handler
    pub(crate) fn start<H, F>(&self, ctx: &Arc<ServerContext>, tls: Option<TlsConfig>, make_handler: F) -> Result<()>
    where
        H: StreamHandler + 'static,
        F: Fn() -> H + Send + 'static,
    {
        let listener = bind_listener(ctx.settings())?;
        if !ctx.begin(listener.local_addr()?) {
            return Err(Error::AlreadyStarted(ctx.name().to_string()));
        }

        let accept_ctx = Arc::clone(ctx);
        let acceptor = spawn_acceptor(ctx, listener, move |stream, remote| {
            spawn_stream(&accept_ctx, tls.clone(), stream, remote, make_handler());
        });

        match acceptor {
            Ok(handle) => {
                *lock(&self.acceptor) = Some(handle);
                Ok(())
            }
            Err(error) => {
                ctx.end();
                Err(error.into())
            }
        }
    }

    pub(crate) fn stop(&self, ctx: &ServerContext) {
        if !ctx.end() {
            return;
        }
        if let Some(handle) = lock(&self.acceptor).take() {
            let _ = handle.join();
        }
        ctx.disconnect_all();
    }
}

/// Stream handler forwarding to a `SocketService`
struct ServiceConnection {
    ctx: Arc<ServerContext>,
    service: Arc<dyn SocketService>,
}

impl StreamHandler for ServiceConnection {
    fn on_open(&mut self, session: &Arc<Session>) {
        let service = Arc::clone(&self.service);
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| service.on_connected(ctx, &session));
    }

    fn on_data(&mut self, session: &Arc<Session>, data: &[u8]) -> bool {
        self.service.on_received(&self.ctx, session, data);
        session.is_connected()
    }

    fn on_error(&mut self, session: &Arc<Session>, error: io::Error) {
        let service = Arc::clone(&self.service);
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| service.on_error(ctx, &session, &error));
    }

    fn on_close(&mut self, session: &Arc<Session>) {
        let service = Arc::clone(&self.service);
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| service.on_disconnected(ctx, &session));
    }
}

/// TCP server, plain or TLS
pub struct TcpServer {
    context: Arc<ServerContext>,
    service: Arc<dyn SocketService>,
    tls: Option<TlsConfig>,
    listener: StreamListener,
}

impl TcpServer {
    /// TLS is enabled when `settings.tls.enabled` is set
    pub fn new(settings: ServerSettings, service: Arc<dyn SocketService>) -> Result<Self> {
        let tls = tls_from_settings(&settings)?;
        Ok(TcpServer {
            context: Arc::new(ServerContext::new(settings)?),
            service,
            tls,
            listener: StreamListener::new(),
        })
    }

    /// TLS server with an explicit configuration
    pub fn with_tls(settings: ServerSettings, service: Arc<dyn SocketService>, tls: TlsConfig) -> Result<Self> {
        Ok(TcpServer {
            context: Arc::new(ServerContext::new(settings)?),
            service,
            tls: Some(tls),
            listener: StreamListener::new(),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

pub(crate) fn tls_from_settings(settings: &ServerSettings) -> Result<Option<TlsConfig>> {
    if settings.tls.enabled {
        Ok(Some(TlsConfig::from_settings(&settings.tls)?))
    } else {
        Ok(None)
    }
}

impl SocketServer for TcpServer {
    fn start(&self) -> Result<()> {
        let ctx = Arc::clone(&self.context);
        let service = Arc::clone(&self.service);
        self.listener.start(&self.context, self.tls.clone(), move || ServiceConnection {
            ctx: Arc::clone(&ctx),
            service: Arc::clone(&service),
        })
    }

    fn stop(&self) {
        self.listener.stop(&self.context);
    }

    fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

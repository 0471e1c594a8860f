//! HTTP and WebSocket servers
//!
//! Each connection parses requests incrementally; bytes past a complete
//! request are fed back in, so pipelined requests work. A WebSocket
//! upgrade switches the connection to frame parsing and hands messages to
//! the configured `SocketService`.

use super::session::{Framing, Session};
use super::socket::{
    on_other_fiber, tls_from_settings, ServerContext, SocketServer, SocketService, StreamHandler, StreamListener,
};
use super::web_api::WebApiControllerService;
use super::Result;
use crate::config::ServerSettings;
use crate::http::tls::TlsConfig;
use crate::http::{HttpRequest, HttpResponse};
use crate::ws::{encode_frame, Opcode, Upgrade, WebSocket, WsHandler};
use std::io;
use std::sync::Arc;

/// Status sent with the close frame answering a protocol error
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Routes WebSocket engine callbacks of one session to its service
struct WsBridge<'a> {
    ctx: &'a Arc<ServerContext>,
    session: &'a Arc<Session>,
    service: &'a Arc<dyn SocketService>,
}

impl WsBridge<'_> {
    fn send_frame(&self, opcode: Opcode, payload: &[u8], status: u16) {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        encode_frame(&mut frame, opcode, true, None, payload, status);
        if let Err(error) = self.session.send(&frame) {
            tracing::debug!(parent: self.ctx.span(), session = %self.session.id(), %error, "frame not delivered");
        }
    }
}

impl WsHandler for WsBridge<'_> {
    fn on_ws_received(&mut self, data: &[u8]) {
        self.service.on_received(self.ctx, self.session, data);
    }

    fn on_ws_ping(&mut self, data: &[u8]) {
        self.send_frame(Opcode::Pong, data, 0);
    }

    fn on_ws_close(&mut self, _data: &[u8], status: u16) {
        tracing::debug!(parent: self.ctx.span(), session = %self.session.id(), status, "WebSocket close received");
        self.send_frame(Opcode::Close, &[], status);
        self.session.disconnect();
    }

    fn on_ws_error(&mut self, error: &str) {
        tracing::warn!(parent: self.ctx.span(), session = %self.session.id(), error, "WebSocket protocol error");
        self.send_frame(Opcode::Close, &[], CLOSE_PROTOCOL_ERROR);
        self.session.disconnect();
    }
}

/// Outcome of feeding bytes to the request parser
enum Feed {
    /// Need more bytes
    Wait,
    /// Close the connection
    Close,
    /// A request completed; these bytes followed it
    Next(Vec<u8>),
}

/// Per-connection state of an `HttpServer`
struct HttpConnection {
    ctx: Arc<ServerContext>,
    controller: Arc<WebApiControllerService>,
    websocket: Option<Arc<dyn SocketService>>,
    websocket_only: bool,
    request: HttpRequest,
    upgraded: Option<WebSocket>,
}

impl HttpConnection {
    fn feed(&mut self, session: &Arc<Session>, data: &[u8]) -> Feed {
        let mut body = data;
        if self.request.is_pending_header() {
            self.request.set_header_buffer(data);
            body = &[];
        }

        if self.request.is_error_set() {
            self.controller
                .on_received_request_error(&self.ctx, session, "Invalid HTTP request");
            return Feed::Close;
        }

        if !(self.request.is_pending_body() && self.request.set_body_buffer(body)) {
            if self.request.cache().len() > self.ctx.settings().max_message_size {
                self.controller
                    .on_received_request_error(&self.ctx, session, "Request too large");
                return Feed::Close;
            }
            return Feed::Wait;
        }

        let request = std::mem::take(&mut self.request);
        let surplus = request.surplus().to_vec();
        if !self.handle_request(session, request) {
            return Feed::Close;
        }
        if surplus.is_empty() {
            Feed::Wait
        } else {
            Feed::Next(surplus)
        }
    }

    /// Dispatch one complete request; false closes the connection
    fn handle_request(&mut self, session: &Arc<Session>, request: HttpRequest) -> bool {
        if let Some(service) = &self.websocket {
            let mut engine = WebSocket::server().with_max_message_size(self.ctx.settings().max_message_size);
            let mut response = HttpResponse::new();
            let mut bridge = WsBridge {
                ctx: &self.ctx,
                session,
                service,
            };
            match engine.perform_server_upgrade(&request, &mut response, &mut bridge) {
                Upgrade::Accepted => {
                    if session.send(response.cache().as_slice()).is_err() {
                        return false;
                    }
                    session.set_framing(Framing::WebSocket);
                    tracing::debug!(parent: self.ctx.span(), session = %session.id(), url = request.url(), "WebSocket upgraded");
                    let service = Arc::clone(service);
                    let opened = Arc::clone(session);
                    on_other_fiber(&self.ctx, move |ctx| service.on_connected(ctx, &opened));
                    self.upgraded = Some(engine);
                    return true;
                }
                Upgrade::Rejected => {
                    let _ = session.send(response.cache().as_slice());
                    return false;
                }
                Upgrade::NotRequested => {}
            }
        }

        if self.websocket_only {
            let mut response = HttpResponse::new();
            response
                .set_begin(400)
                .set_header("Connection", "close")
                .set_header("Content-Type", "text/plain; charset=UTF-8")
                .set_body(b"WebSocket upgrade required");
            let _ = session.send(response.cache().as_slice());
            return false;
        }

        self.controller.on_received(&self.ctx, session, request);
        true
    }

    fn receive_frames(&mut self, session: &Arc<Session>, data: &[u8]) {
        let (Some(engine), Some(service)) = (self.upgraded.as_mut(), self.websocket.as_ref()) else {
            return;
        };
        let mut bridge = WsBridge {
            ctx: &self.ctx,
            session,
            service,
        };
        engine.prepare_receive_frame(data, &mut bridge);
    }
}

impl StreamHandler for HttpConnection {
    fn on_open(&mut self, session: &Arc<Session>) {
        let controller = Arc::clone(&self.controller);
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| controller.on_connected(ctx, &session));
    }

    fn on_data(&mut self, session: &Arc<Session>, data: &[u8]) -> bool {
        if self.upgraded.is_some() {
            self.receive_frames(session, data);
            return session.is_connected();
        }

        let mut next = self.feed(session, data);
        loop {
            match next {
                Feed::Wait => return session.is_connected(),
                Feed::Close => return false,
                Feed::Next(surplus) => {
                    if !session.is_connected() {
                        return false;
                    }
                    if self.upgraded.is_some() {
                        self.receive_frames(session, &surplus);
                        return session.is_connected();
                    }
                    next = self.feed(session, &surplus);
                }
            }
        }
    }

    fn on_error(&mut self, session: &Arc<Session>, error: io::Error) {
        let controller = Arc::clone(&self.controller);
        let service = self.upgraded.as_ref().and(self.websocket.clone());
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| match service {
            Some(service) => service.on_error(ctx, &session, &error),
            None => controller.on_error(ctx, &session, &error),
        });
    }

    fn on_close(&mut self, session: &Arc<Session>) {
        let controller = Arc::clone(&self.controller);
        let service = self.upgraded.as_ref().and(self.websocket.clone());
        let session = Arc::clone(session);
        on_other_fiber(&self.ctx, move |ctx| {
            if let Some(service) = service {
                service.on_disconnected(ctx, &session);
            }
            controller.on_disconnected(ctx, &session);
        });
    }
}

/// Web API server with optional WebSocket upgrade, plain or TLS
pub struct HttpServer {
    context: Arc<ServerContext>,
    controller: Arc<WebApiControllerService>,
    websocket: Option<Arc<dyn SocketService>>,
    websocket_only: bool,
    tls: Option<TlsConfig>,
    listener: StreamListener,
}

impl HttpServer {
    /// TLS is enabled when `settings.tls.enabled` is set
    pub fn new(settings: ServerSettings, controller: WebApiControllerService) -> Result<Self> {
        let tls = tls_from_settings(&settings)?;
        Ok(HttpServer {
            context: Arc::new(ServerContext::new(settings)?),
            controller: Arc::new(controller),
            websocket: None,
            websocket_only: false,
            tls,
            listener: StreamListener::new(),
        })
    }

    /// Accept WebSocket upgrades, delivering messages to `service`
    pub fn with_websocket(mut self, service: Arc<dyn SocketService>) -> Self {
        self.websocket = Some(service);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn controller(&self) -> &Arc<WebApiControllerService> {
        &self.controller
    }
}

impl SocketServer for HttpServer {
    fn start(&self) -> Result<()> {
        let ctx = Arc::clone(&self.context);
        let controller = Arc::clone(&self.controller);
        let websocket = self.websocket.clone();
        let websocket_only = self.websocket_only;
        self.listener.start(&self.context, self.tls.clone(), move || HttpConnection {
            ctx: Arc::clone(&ctx),
            controller: Arc::clone(&controller),
            websocket: websocket.clone(),
            websocket_only,
            request: HttpRequest::new(),
            upgraded: None,
        })
    }

    fn stop(&self) {
        self.listener.stop(&self.context);
    }

    fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// WebSocket-only server; plain HTTP requests get `400 Bad Request`
pub struct WsServer {
    inner: HttpServer,
}

impl WsServer {
    pub fn new(settings: ServerSettings, service: Arc<dyn SocketService>) -> Result<Self> {
        let mut inner = HttpServer::new(settings, WebApiControllerService::default())?.with_websocket(service);
        inner.websocket_only = true;
        Ok(WsServer { inner })
    }

    pub fn with_tls(self, tls: TlsConfig) -> Self {
        WsServer {
            inner: self.inner.with_tls(tls),
        }
    }
}

impl SocketServer for WsServer {
    fn start(&self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn context(&self) -> &Arc<ServerContext> {
        self.inner.context()
    }
}

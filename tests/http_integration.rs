//! Integration tests for the HTTP layer
//!
//! These tests run an `HttpServer` on loopback and talk to it with
//! `HttpClient` or raw sockets.

use protonnet::config::ServerSettings;
use protonnet::http::session::FdSessionOps;
use protonnet::http::{HttpClient, HttpRequest, HttpResponse, Method};
use protonnet::server::web_api::Router;
use protonnet::server::{
    HttpServer, Session, SocketServer, StaticContentCache, WebApiControllerService,
};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

fn settings(name: &str) -> ServerSettings {
    ServerSettings {
        name: name.to_string(),
        ..ServerSettings::default()
    }
}

fn text(body: &str) -> HttpResponse {
    let mut response = HttpResponse::new();
    response.make_get_response(body.as_bytes(), "text/plain");
    response
}

fn router() -> Router {
    let mut router = Router::new();
    router
        .route(Method::Get, "/hello", |_request: &HttpRequest, _session: &Arc<Session>| {
            Ok(text("Hello World"))
        })
        .route(Method::Post, "/echo", |request: &HttpRequest, _session: &Arc<Session>| {
            let mut response = HttpResponse::new();
            response.make_get_response(request.body(), "application/octet-stream");
            Ok(response)
        })
        .route(Method::Get, "/fail", |_request: &HttpRequest, _session: &Arc<Session>| {
            Err("storage unavailable".into())
        })
        .route(Method::Get, "/panic", |_request: &HttpRequest, _session: &Arc<Session>| {
            panic!("handler bug")
        });
    router
}

fn client(addr: SocketAddr) -> HttpClient<FdSessionOps> {
    let stream = TcpStream::connect(addr).unwrap();
    let mut client = HttpClient::new(FdSessionOps::new(stream));
    client.set_timeout(Duration::from_secs(5));
    client
}

#[test]
fn test_http_request_response_cycle() {
    let server = HttpServer::new(settings("http-cycle"), WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();
    let mut client = client(server.local_addr().unwrap());

    let response = client.get("/hello").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body(), b"Hello World");

    // Same connection, query strings ignored by routing
    let response = client.get("/hello?lang=en").unwrap();
    assert_eq!(response.status(), 200);

    server.stop();
}

#[test]
fn test_http_post_with_body() {
    let server = HttpServer::new(settings("http-post"), WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();
    let mut client = client(server.local_addr().unwrap());

    let response = client.post("/echo", b"test data", "text/plain").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"test data");

    let large = "Hello World".repeat(2000);
    let response = client.post("/echo", large.as_bytes(), "text/plain").unwrap();
    assert_eq!(response.body_length(), large.len());
    assert_eq!(response.body(), large.as_bytes());

    server.stop();
}

#[test]
fn test_http_error_statuses() {
    let server = HttpServer::new(settings("http-errors"), WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();
    let mut client = client(server.local_addr().unwrap());

    assert_eq!(client.get("/missing").unwrap().status(), 404);
    assert_eq!(client.get("/fail").unwrap().status(), 500);
    assert_eq!(client.get("/panic").unwrap().status(), 500);

    let mut request = HttpRequest::new();
    request.set_begin("DELETE", "/hello").set_header("Host", "localhost").set_body(&[]);
    client.send_request(&request).unwrap();
    let response = client.receive_response().unwrap();
    assert_eq!(response.status(), 405);
    assert_eq!(response.header("Allow"), Some("GET"));

    let mut request = HttpRequest::new();
    request.make_options_request("/hello");
    client.send_request(&request).unwrap();
    let response = client.receive_response().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Allow"), Some("GET, OPTIONS"));

    // The connection survives all of the above
    assert_eq!(client.get("/hello").unwrap().status(), 200);
    server.stop();
}

#[test]
fn test_static_content() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
    fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();

    let mut cache = StaticContentCache::new();
    cache.register_folder("/", dir.path()).unwrap();
    let controller = WebApiControllerService::new(router()).with_static_content(cache);

    let server = HttpServer::new(settings("http-static"), controller).unwrap();
    server.start().unwrap();
    let mut client = client(server.local_addr().unwrap());

    let response = client.get("/").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/html; charset=UTF-8"));
    assert_eq!(response.body(), b"<h1>home</h1>");

    let response = client.get("/app.js").unwrap();
    assert_eq!(response.header("Content-Type"), Some("text/javascript; charset=UTF-8"));

    // Static hits never reach admission or the router
    assert_eq!(client.get("/hello").unwrap().status(), 200);
    server.stop();
}

#[test]
fn test_session_rate_limit() {
    let settings = ServerSettings {
        max_session_request_per_second: 2,
        ..settings("http-rate")
    };
    let server = HttpServer::new(settings, WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();
    let mut client = client(server.local_addr().unwrap());

    assert_eq!(client.get("/hello").unwrap().status(), 200);
    assert_eq!(client.get("/hello").unwrap().status(), 200);
    assert_eq!(client.get("/hello").unwrap().status(), 429);

    // Another connection is another session with its own window
    let mut other = self::client(server.local_addr().unwrap());
    assert_eq!(other.get("/hello").unwrap().status(), 200);
    server.stop();
}

#[test]
fn test_malformed_request_closes_connection() {
    let server = HttpServer::new(settings("http-bad"), WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nNoColonHere\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let mut response = HttpResponse::new();
    assert!(response.set_header_buffer(&raw));
    assert_eq!(response.status(), 400);
    assert_eq!(response.header("Connection"), Some("close"));
    server.stop();
}

#[test]
fn test_connection_close_header() {
    let server = HttpServer::new(settings("http-close"), WebApiControllerService::new(router())).unwrap();
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let mut response = HttpResponse::new();
    assert!(response.set_header_buffer(&raw));
    assert!(response.set_body_buffer(&[]));
    assert_eq!(response.body(), b"Hello World");

    let stats = server.network_statistics();
    assert!(stats.bytes_received() > 0);
    server.stop();
}

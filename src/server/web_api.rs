//! Web API controller service
//!
//! Routes are registered explicitly with `Router::route`. A pattern is
//! either an exact path or a prefix ending in `/*`. Matching ignores the
//! query string.
//!
//! Request flow for each complete HTTP request:
//!
//! 1. GET requests hitting the `StaticContentCache` are answered at once
//! 2. request admission; rejected requests get `429 Too Many Requests`
//! 3. the route handler runs on the `received` fiber worker of the session,
//!    so pipelined requests are answered in order
//! 4. handler errors and panics become `500 Internal Server Error`

use super::session::Session;
use super::socket::ServerContext;
use crate::http::{HttpRequest, HttpResponse, Method};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

/// Error returned by a route handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Route handler, run on the `received` fiber
pub type RouteHandler =
    Arc<dyn Fn(&HttpRequest, &Arc<Session>) -> Result<HttpResponse, HandlerError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(prefix) => Pattern::Prefix(prefix.to_string()),
            None => Pattern::Exact(pattern.to_string()),
        }
    }

    /// Match quality: exact beats any prefix, longer prefixes beat shorter
    fn rank(&self, path: &str) -> Option<usize> {
        match self {
            Pattern::Exact(exact) => (exact == path).then_some(usize::MAX),
            Pattern::Prefix(prefix) => {
                let rest = path.strip_prefix(prefix.as_str())?;
                (rest.is_empty() || rest.starts_with('/')).then_some(prefix.len())
            }
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: RouteHandler,
}

/// Result of looking a request up in the router
pub enum Resolution {
    Found(RouteHandler),
    /// The path exists for these other methods
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// Request path without query string or fragment
pub fn request_path(url: &str) -> &str {
    let end = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
    &url[..end]
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` on `pattern`; later registrations of
    /// the same method and pattern replace earlier ones
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl Fn(&HttpRequest, &Arc<Session>) -> Result<HttpResponse, HandlerError> + Send + Sync + 'static,
    ) -> &mut Self {
        let pattern = Pattern::parse(pattern);
        self.routes
            .retain(|route| !(route.method == method && route.pattern == pattern));
        self.routes.push(Route {
            method,
            pattern,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, method: &str, url: &str) -> Resolution {
        let path = request_path(url);
        let method = method.parse::<Method>().ok();

        let mut best: Option<(usize, &Route)> = None;
        let mut allowed = Vec::new();
        for route in &self.routes {
            let Some(rank) = route.pattern.rank(path) else {
                continue;
            };
            if Some(route.method) != method {
                if !allowed.contains(&route.method) {
                    allowed.push(route.method);
                }
                continue;
            }
            if best.map_or(true, |(current, _)| rank > current) {
                best = Some((rank, route));
            }
        }

        match best {
            Some((_, route)) => Resolution::Found(Arc::clone(&route.handler)),
            None if !allowed.is_empty() => Resolution::MethodNotAllowed(allowed),
            None => Resolution::NotFound,
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| (r.method, &r.pattern)))
            .finish()
    }
}

/// Content type by file extension
pub fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=UTF-8",
        Some("css") => "text/css; charset=UTF-8",
        Some("js" | "mjs") => "text/javascript; charset=UTF-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=UTF-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Pre-built `200 OK` responses keyed by request path
#[derive(Debug, Default, Clone)]
pub struct StaticContentCache {
    entries: HashMap<String, Arc<[u8]>>,
}

impl StaticContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `file` at `url_path`
    pub fn register_file(&mut self, url_path: &str, file: impl AsRef<Path>) -> io::Result<()> {
        let file = file.as_ref();
        let content = fs::read(file)?;
        let mut response = HttpResponse::new();
        response.make_get_response(&content, mime_type(file));
        self.entries
            .insert(url_path.to_string(), Arc::from(response.cache().as_slice()));
        Ok(())
    }

    /// Serve every file below `folder` under `url_prefix`
    ///
    /// `index.html` is also served at its directory path with a trailing
    /// slash. Returns the number of files registered.
    pub fn register_folder(&mut self, url_prefix: &str, folder: impl AsRef<Path>) -> io::Result<usize> {
        let prefix = url_prefix.trim_end_matches('/');
        self.register_dir(prefix, folder.as_ref())
    }

    fn register_dir(&mut self, prefix: &str, dir: &Path) -> io::Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let url = format!("{}/{}", prefix, name);

            if entry.file_type()?.is_dir() {
                count += self.register_dir(&url, &path)?;
                continue;
            }

            self.register_file(&url, &path)?;
            count += 1;
            if name == "index.html" {
                if let Some(response) = self.entries.get(&url).cloned() {
                    self.entries.insert(format!("{}/", prefix), response);
                }
            }
        }
        Ok(count)
    }

    /// Wire bytes of the response for `url`
    pub fn get(&self, url: &str) -> Option<Arc<[u8]>> {
        self.entries.get(request_path(url)).cloned()
    }

    pub fn remove(&mut self, url_path: &str) -> bool {
        self.entries.remove(url_path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn wants_close(request: &HttpRequest) -> bool {
    request
        .header("Connection")
        .is_some_and(|value| value.eq_ignore_ascii_case("close"))
}

fn send_response(ctx: &ServerContext, session: &Session, wire: &[u8]) {
    if let Err(error) = session.send(wire) {
        tracing::debug!(parent: ctx.span(), session = %session.id(), %error, "response not delivered");
    }
}

/// Controller side of an `HttpServer`
#[derive(Debug, Default)]
pub struct WebApiControllerService {
    router: Router,
    static_content: StaticContentCache,
}

impl WebApiControllerService {
    pub fn new(router: Router) -> Self {
        WebApiControllerService {
            router,
            static_content: StaticContentCache::new(),
        }
    }

    pub fn with_static_content(mut self, static_content: StaticContentCache) -> Self {
        self.static_content = static_content;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn static_content(&self) -> &StaticContentCache {
        &self.static_content
    }

    pub fn on_connected(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>) {
        tracing::trace!(parent: ctx.span(), session = %session.id(), remote = %session.remote_addr(), "HTTP session open");
    }

    /// Answer one complete request
    pub fn on_received(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, request: HttpRequest) {
        let close = wants_close(&request);

        if request.method() == "GET" {
            if let Some(wire) = self.static_content.get(request.url()) {
                send_response(ctx, session, &wire);
                if close {
                    session.disconnect();
                }
                return;
            }
        }

        let guard = match ctx.admission().try_admit(session.id()) {
            Ok(guard) => guard,
            Err(rejection) => {
                tracing::warn!(
                    parent: ctx.span(),
                    session = %session.id(),
                    method = request.method(),
                    url = request.url(),
                    %rejection,
                    "HTTP request rejected"
                );
                let mut response = HttpResponse::new();
                response.make_error_response(429, &rejection.to_string());
                send_response(ctx, session, response.cache().as_slice());
                return;
            }
        };

        let resolution = self.router.resolve(request.method(), request.url());
        let job_ctx = Arc::clone(ctx);
        let job_session = Arc::clone(session);
        let queued = ctx.received_fiber().enqueue_keyed(session.id().0, move || {
            let _guard = guard;
            let response = dispatch(&job_ctx, &job_session, &request, resolution);
            send_response(&job_ctx, &job_session, response.cache().as_slice());
            if close {
                job_session.disconnect();
            }
        });
        if !queued {
            tracing::debug!(parent: ctx.span(), "received fiber stopped, request dropped");
        }
    }

    /// A request that could not be parsed; answers 400 and closes
    pub fn on_received_request_error(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, error: &str) {
        tracing::debug!(parent: ctx.span(), session = %session.id(), error, "bad HTTP request");
        let mut response = HttpResponse::new();
        response
            .set_begin(400)
            .set_header("Connection", "close")
            .set_header("Content-Type", "text/plain; charset=UTF-8")
            .set_body(error.as_bytes());
        send_response(ctx, session, response.cache().as_slice());
        session.disconnect();
    }

    pub fn on_disconnected(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>) {
        tracing::trace!(parent: ctx.span(), session = %session.id(), "HTTP session closed");
    }

    pub fn on_error(&self, ctx: &Arc<ServerContext>, session: &Arc<Session>, error: &io::Error) {
        tracing::warn!(parent: ctx.span(), session = %session.id(), %error, "HTTP session error");
    }
}

fn dispatch(ctx: &ServerContext, session: &Arc<Session>, request: &HttpRequest, resolution: Resolution) -> HttpResponse {
    let mut response = HttpResponse::new();
    match resolution {
        Resolution::Found(handler) => {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(request, session))) {
                Ok(Ok(handled)) => return handled,
                Ok(Err(error)) => {
                    tracing::error!(parent: ctx.span(), url = request.url(), %error, "route handler failed");
                }
                Err(_) => {
                    tracing::error!(parent: ctx.span(), url = request.url(), "route handler panicked");
                }
            }
            response.make_error_response(500, "Internal Server Error");
        }
        Resolution::MethodNotAllowed(allowed) => match request.method() {
            "OPTIONS" => {
                let mut methods: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                methods.push("OPTIONS");
                response
                    .set_begin(200)
                    .set_header("Allow", &methods.join(", "))
                    .set_body(&[]);
            }
            _ => {
                let methods: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                response
                    .set_begin(405)
                    .set_header("Allow", &methods.join(", "))
                    .set_header("Content-Type", "text/plain; charset=UTF-8")
                    .set_body(b"Method Not Allowed");
            }
        },
        Resolution::NotFound => match request.method() {
            "OPTIONS" => {
                response.make_options_response();
            }
            "TRACE" => {
                let raw = request.cache().as_slice();
                let end = raw.len() - request.surplus().len();
                response.make_trace_response(&raw[..end]);
            }
            _ => {
                response.make_error_response(404, "Not Found");
            }
        },
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ok(body: &'static str) -> impl Fn(&HttpRequest, &Arc<Session>) -> Result<HttpResponse, HandlerError> {
        move |_request: &HttpRequest, _session: &Arc<Session>| {
            let mut response = HttpResponse::new();
            response.make_get_response(body.as_bytes(), "text/plain");
            Ok(response)
        }
    }

    fn found(resolution: Resolution) -> bool {
        matches!(resolution, Resolution::Found(_))
    }

    #[test]
    fn test_exact_and_prefix_routes() {
        let mut router = Router::new();
        router
            .route(Method::Get, "/users", ok("list"))
            .route(Method::Get, "/users/*", ok("one"))
            .route(Method::Post, "/users", ok("create"));
        assert_eq!(router.len(), 3);

        assert!(found(router.resolve("GET", "/users?page=2")));
        assert!(found(router.resolve("GET", "/users/42")));
        assert!(found(router.resolve("POST", "/users")));
        assert!(matches!(router.resolve("GET", "/usersx"), Resolution::NotFound));

        match router.resolve("DELETE", "/users") {
            Resolution::MethodNotAllowed(allowed) => {
                assert_eq!(allowed.len(), 2);
                assert!(allowed.contains(&Method::Get) && allowed.contains(&Method::Post));
            }
            _ => panic!("expected 405"),
        }
        assert!(matches!(router.resolve("BREW", "/users"), Resolution::MethodNotAllowed(_)));
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut router = Router::new();
        router.route(Method::Get, "/a", ok("1")).route(Method::Get, "/a", ok("2"));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("/a/b?x=1#top"), "/a/b");
        assert_eq!(request_path("/"), "/");
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type(Path::new("index.HTML")), "text/html; charset=UTF-8");
        assert_eq!(mime_type(Path::new("app.js")), "text/javascript; charset=UTF-8");
        assert_eq!(mime_type(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_register_folder() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::File::create(dir.path().join("index.html"))
            .unwrap()
            .write_all(b"<h1>home</h1>")
            .unwrap();
        fs::File::create(dir.path().join("css/site.css"))
            .unwrap()
            .write_all(b"body{}")
            .unwrap();

        let mut cache = StaticContentCache::new();
        assert_eq!(cache.register_folder("/static/", dir.path()).unwrap(), 2);
        assert_eq!(cache.len(), 3);

        let wire = cache.get("/static/css/site.css?v=3").unwrap();
        let mut response = HttpResponse::new();
        assert!(response.set_header_buffer(&wire));
        assert!(response.set_body_buffer(&[]));
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("text/css; charset=UTF-8"));
        assert_eq!(response.body(), b"body{}");

        assert_eq!(cache.get("/static/"), cache.get("/static/index.html"));
        assert!(cache.get("/static/missing.js").is_none());
        assert!(cache.register_file("/x", dir.path().join("nope")).is_err());
    }
}

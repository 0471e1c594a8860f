//! HTTP response composer and incremental parser

use super::message::{reason_phrase, ParseState};
use super::parser;
use super::{Cookies, Error, Headers, CRLF, HTTP_PROTOCOL};
use crate::buffer::MemoryBuffer;
use std::borrow::Cow;
use std::fmt;

/// Allowed methods advertised by `make_options_response`
pub const ALLOWED_METHODS: &str = "HEAD,GET,POST,PUT,DELETE,OPTIONS,TRACE";

/// A `Set-Cookie` header value
///
/// Rendered as `name=value; Max-Age=N[; Domain=D][; Path=P][; Secure]
/// [; SameSite=Strict][; HttpOnly]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub max_age: u64,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub strict: bool,
    pub http_only: bool,
}

impl SetCookie {
    /// Cookie with a one day lifetime and no attributes
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        SetCookie {
            name: name.into(),
            value: value.into(),
            max_age: 86400,
            domain: None,
            path: None,
            secure: false,
            strict: false,
            http_only: false,
        }
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}; Max-Age={}", self.name, self.value, self.max_age)?;
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.strict {
            f.write_str("; SameSite=Strict")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// HTTP response
///
/// Mirrors `HttpRequest`: composed in place for sending, or accumulated
/// incrementally from socket reads.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    cache: MemoryBuffer,
    status: u16,
    status_phrase: String,
    protocol: String,
    headers: Headers,
    cookies: Cookies,
    cursor: parser::BodyCursor,
    state: ParseState,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric status code (0 until a status line is known)
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_phrase(&self) -> &str {
        &self.status_phrase
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    pub fn body(&self) -> &[u8] {
        self.cursor.body(self.cache.as_slice())
    }

    pub fn body_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }

    pub fn body_length(&self) -> usize {
        self.cursor.length
    }

    /// Bytes received past the end of a complete message
    ///
    /// Pipelined data, or the first frames of an upgraded connection.
    pub fn surplus(&self) -> &[u8] {
        if self.state != ParseState::Complete {
            return &[];
        }
        self.cursor.surplus(self.cache.as_slice())
    }

    pub fn cache(&self) -> &MemoryBuffer {
        &self.cache
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn is_pending_header(&self) -> bool {
        matches!(self.state, ParseState::Empty | ParseState::PendingHeader)
    }

    pub fn is_pending_body(&self) -> bool {
        self.state == ParseState::PendingBody
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    pub fn is_error_set(&self) -> bool {
        self.state == ParseState::ErrorSet
    }

    pub fn clear(&mut self) -> &mut Self {
        self.cache.clear();
        self.status = 0;
        self.status_phrase.clear();
        self.protocol.clear();
        self.headers.clear();
        self.cookies.clear();
        self.cursor = parser::BodyCursor::default();
        self.state = ParseState::Empty;
        self
    }

    /// Start a new `HTTP/1.1` response with the canonical reason phrase
    pub fn set_begin(&mut self, status: u16) -> &mut Self {
        self.set_begin_with_protocol(status, HTTP_PROTOCOL)
    }

    pub fn set_begin_with_protocol(&mut self, status: u16, protocol: &str) -> &mut Self {
        self.clear();

        let phrase = reason_phrase(status);
        self.cache.write_str(protocol);
        self.cache.write_str(" ");
        self.cache.write_str(&status.to_string());
        self.cache.write_str(" ");
        self.cache.write_str(phrase);
        self.cache.write_str(CRLF);

        self.status = status;
        self.status_phrase = phrase.to_string();
        self.protocol = protocol.to_string();
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.cache.write_str(name);
        self.cache.write_str(": ");
        self.cache.write_str(value);
        self.cache.write_str(CRLF);

        self.headers.insert(name, value);
        self
    }

    pub fn set_cookie(&mut self, cookie: &SetCookie) -> &mut Self {
        self.set_header("Set-Cookie", &cookie.to_string());
        self.cookies.insert(cookie.name.clone(), cookie.value.clone());
        self
    }

    pub fn set_body(&mut self, body: &[u8]) -> &mut Self {
        self.set_header("Content-Length", &body.len().to_string());
        self.cache.write_str(CRLF);

        self.cursor = parser::BodyCursor::declared(self.cache.len(), body.len());
        self.cache.write(body);
        self.cursor.size = body.len();
        self.state = ParseState::Complete;
        self
    }

    pub fn set_body_length(&mut self, length: usize) -> &mut Self {
        self.set_header("Content-Length", &length.to_string());
        self.cache.write_str(CRLF);

        self.cursor = parser::BodyCursor::declared(self.cache.len(), length);
        self.state = ParseState::PendingBody;
        self
    }

    pub fn make_ok_response(&mut self) -> &mut Self {
        self.set_begin(200).set_body(&[])
    }

    /// Plain-text error response
    pub fn make_error_response(&mut self, status: u16, content: &str) -> &mut Self {
        self.set_begin(status)
            .set_header("Content-Type", "text/plain; charset=UTF-8")
            .set_body(content.as_bytes())
    }

    pub fn make_head_response(&mut self) -> &mut Self {
        self.set_begin(200).set_body(&[])
    }

    pub fn make_get_response(&mut self, content: &[u8], content_type: &str) -> &mut Self {
        self.set_begin(200);
        if !content_type.is_empty() {
            self.set_header("Content-Type", content_type);
        }
        self.set_body(content)
    }

    pub fn make_options_response(&mut self) -> &mut Self {
        self.set_begin(200)
            .set_header("Allow", ALLOWED_METHODS)
            .set_body(&[])
    }

    /// Echo the received request back as `message/http`
    pub fn make_trace_response(&mut self, request: &[u8]) -> &mut Self {
        self.set_begin(200)
            .set_header("Content-Type", "message/http")
            .set_body(request)
    }

    /// Feed raw bytes while the header block is incomplete
    ///
    /// Same contract as `HttpRequest::set_header_buffer`. The status code
    /// must be numeric.
    pub fn set_header_buffer(&mut self, bytes: &[u8]) -> bool {
        let Some(terminator) = parser::feed_header(&mut self.cache, &mut self.cursor, bytes) else {
            if !self.cache.is_empty() {
                self.state = ParseState::PendingHeader;
            }
            return false;
        };

        if self.parse_header_block(terminator).is_err() {
            self.state = ParseState::ErrorSet;
            return false;
        }

        parser::begin_body(&self.cache, &mut self.cursor, terminator);
        self.state = ParseState::PendingBody;
        true
    }

    /// Feed raw bytes after the header block
    ///
    /// Without a Content-Length, informational, 204 and 304 responses have
    /// no body; anything else is complete once the bytes end with CRLFCRLF.
    pub fn set_body_buffer(&mut self, bytes: &[u8]) -> bool {
        let bodyless = self.status < 200 || self.status == 204 || self.status == 304;
        let complete = parser::feed_body(&mut self.cache, &mut self.cursor, bytes, bodyless);

        if complete {
            self.state = ParseState::Complete;
        }
        complete
    }

    fn parse_header_block(&mut self, terminator: usize) -> super::Result<()> {
        self.headers.clear();
        self.cookies.clear();
        self.cursor.reset_length();

        let block = &self.cache.as_slice()[..terminator + 2];
        let line = parser::parse_start_line(block)?;
        if line.second.is_empty() || !line.second.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStatus(line.second));
        }
        let status = line
            .second
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatus(line.second.clone()))?;
        let content_length = parser::parse_header_lines(
            block,
            line.next,
            "Set-Cookie",
            &mut self.headers,
            &mut self.cookies,
        )?;

        self.protocol = line.first;
        self.status = status;
        self.status_phrase = line.third;
        self.cursor.set_content_length(content_length);
        Ok(())
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.protocol, self.status, self.status_phrase)
    }
}

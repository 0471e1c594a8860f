//! HTTP request composer and incremental parser

use super::message::{Method, ParseState};
use super::parser;
use super::{Cookies, Headers, CRLF, HTTP_PROTOCOL};
use crate::buffer::MemoryBuffer;
use std::borrow::Cow;
use std::fmt;

/// HTTP request
///
/// The same object is used to build outgoing requests and to accumulate
/// incoming ones. `cache` always holds the exact wire bytes seen so far;
/// everything else is derived from it.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    cache: MemoryBuffer,
    method: String,
    url: String,
    protocol: String,
    headers: Headers,
    cookies: Cookies,
    cursor: parser::BodyCursor,
    state: ParseState,
}

impl HttpRequest {
    /// Create a new empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Request method as received (`GET`, `POST`, ...)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Typed method, if it is one of the standard methods
    pub fn method_kind(&self) -> Option<Method> {
        self.method.parse().ok()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    /// Body bytes received (or composed) so far
    pub fn body(&self) -> &[u8] {
        self.cursor.body(self.cache.as_slice())
    }

    pub fn body_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }

    /// Declared body length (Content-Length)
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

    /// Raw wire bytes
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

    /// Reset to the empty state, keeping the cache allocation
    pub fn clear(&mut self) -> &mut Self {
        self.cache.clear();
        self.method.clear();
        self.url.clear();
        self.protocol.clear();
        self.headers.clear();
        self.cookies.clear();
        self.cursor = parser::BodyCursor::default();
        self.state = ParseState::Empty;
        self
    }

    /// Start a new request: `METHOD SP URL SP HTTP/1.1 CRLF`
    pub fn set_begin(&mut self, method: &str, url: &str) -> &mut Self {
        self.clear();

        self.cache.write_str(method);
        self.cache.write_str(" ");
        self.cache.write_str(url);
        self.cache.write_str(" ");
        self.cache.write_str(HTTP_PROTOCOL);
        self.cache.write_str(CRLF);

        self.method = method.to_string();
        self.url = url.to_string();
        self.protocol = HTTP_PROTOCOL.to_string();
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

    /// Append a `Cookie: name=value` header
    pub fn set_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        let cookie = format!("{}={}", name, value);
        self.set_header("Cookie", &cookie);
        self.cookies.insert(name, value);
        self
    }

    /// Write Content-Length, the blank line and the body
    pub fn set_body(&mut self, body: &[u8]) -> &mut Self {
        self.set_header("Content-Length", &body.len().to_string());
        self.cache.write_str(CRLF);

        self.cursor = parser::BodyCursor::declared(self.cache.len(), body.len());
        self.cache.write(body);
        self.cursor.size = body.len();
        self.state = ParseState::Complete;
        self
    }

    /// Write Content-Length and the blank line; the body is streamed later
    pub fn set_body_length(&mut self, length: usize) -> &mut Self {
        self.set_header("Content-Length", &length.to_string());
        self.cache.write_str(CRLF);

        self.cursor = parser::BodyCursor::declared(self.cache.len(), length);
        self.state = ParseState::PendingBody;
        self
    }

    pub fn make_head_request(&mut self, url: &str) -> &mut Self {
        self.set_begin(Method::Head.as_str(), url).set_body(&[])
    }

    pub fn make_get_request(&mut self, url: &str) -> &mut Self {
        self.set_begin(Method::Get.as_str(), url).set_body(&[])
    }

    pub fn make_post_request(&mut self, url: &str, content: &[u8], content_type: &str) -> &mut Self {
        self.make_content_request(Method::Post, url, content, content_type)
    }

    pub fn make_put_request(&mut self, url: &str, content: &[u8], content_type: &str) -> &mut Self {
        self.make_content_request(Method::Put, url, content, content_type)
    }

    pub fn make_delete_request(&mut self, url: &str) -> &mut Self {
        self.set_begin(Method::Delete.as_str(), url).set_body(&[])
    }

    pub fn make_options_request(&mut self, url: &str) -> &mut Self {
        self.set_begin(Method::Options.as_str(), url).set_body(&[])
    }

    pub fn make_trace_request(&mut self, url: &str) -> &mut Self {
        self.set_begin(Method::Trace.as_str(), url).set_body(&[])
    }

    fn make_content_request(
        &mut self,
        method: Method,
        url: &str,
        content: &[u8],
        content_type: &str,
    ) -> &mut Self {
        self.set_begin(method.as_str(), url);
        if !content_type.is_empty() {
            self.set_header("Content-Type", content_type);
        }
        self.set_body(content)
    }

    /// Feed raw bytes while the header block is incomplete
    ///
    /// Returns true once the header block has been found and parsed. Bytes
    /// that arrived after the blank line are already counted as body. On a
    /// malformed block the error flag is set and false is returned; the
    /// scan position is not advanced, so later calls fail the same way.
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
    /// Returns true once the body is complete: Content-Length bytes when it
    /// was declared, immediately for body-less methods, otherwise when the
    /// received bytes end with CRLFCRLF.
    pub fn set_body_buffer(&mut self, bytes: &[u8]) -> bool {
        let bodyless = self.method_kind().is_some_and(|m| m.is_bodyless());
        let complete = parser::feed_body(&mut self.cache, &mut self.cursor, bytes, bodyless);

        if complete {
            self.state = ParseState::Complete;
        }
        complete
    }

    /// Re-parse the whole header block from offset 0
    fn parse_header_block(&mut self, terminator: usize) -> super::Result<()> {
        self.headers.clear();
        self.cookies.clear();
        self.cursor.reset_length();

        let block = &self.cache.as_slice()[..terminator + 2];
        let line = parser::parse_start_line(block)?;
        let content_length =
            parser::parse_header_lines(block, line.next, "Cookie", &mut self.headers, &mut self.cookies)?;

        self.method = line.first;
        self.url = line.second;
        self.protocol = line.third;
        self.cursor.set_content_length(content_length);
        Ok(())
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.url, self.protocol)
    }
}

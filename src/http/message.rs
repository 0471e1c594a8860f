//! HTTP message vocabulary
//!
//! Methods, status codes and the parse state shared by requests and
//! responses.

use super::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Methods whose requests carry no body unless Content-Length says so
    pub fn is_bodyless(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Delete | Method::Options | Method::Trace
        )
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        reason_phrase(self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const OK: Status = Status { code: 200 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const TOO_MANY_REQUESTS: Status = Status { code: 429 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Canonical reason phrase for a numeric status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Progress of an incremental parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    /// Nothing received yet
    #[default]
    Empty,
    /// Header block not terminated yet
    PendingHeader,
    /// Header parsed, body still arriving
    PendingBody,
    /// Whole message available
    Complete,
    /// Header block found but malformed
    ErrorSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_str() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("POST".parse::<Method>().unwrap(), Method::Post);
        assert!("get".parse::<Method>().is_err());
        assert!("INVALID".parse::<Method>().is_err());
    }

    #[test]
    fn test_bodyless_methods() {
        for method in [Method::Get, Method::Head, Method::Delete, Method::Options, Method::Trace] {
            assert!(method.is_bodyless(), "{} should be bodyless", method);
        }
        for method in [Method::Post, Method::Put, Method::Patch, Method::Connect] {
            assert!(!method.is_bodyless(), "{} should carry a body", method);
        }
    }

    #[test]
    fn test_status() {
        let status = Status::new(200).unwrap();
        assert_eq!(status.code(), 200);
        assert_eq!(status.reason_phrase(), "OK");
        assert!(status.is_success());
        assert!(!status.is_client_error());
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
    }

    #[test]
    fn test_too_many_requests_phrase() {
        assert_eq!(Status::TOO_MANY_REQUESTS.to_string(), "429 Too Many Requests");
        assert_eq!(reason_phrase(799), "Unknown");
    }
}

//! Header-block scanners and body tracking shared by `HttpRequest` and
//! `HttpResponse`
//!
//! The message types own their byte caches. A header block is everything up
//! to and including the CRLF that ends the last header line, i.e.
//! `cache[..terminator + 2]`. Each type parses its own start line; the
//! terminator search and body accounting live here.

use super::{Cookies, Error, Headers, Result};
use crate::buffer::MemoryBuffer;

/// Blank line separating the header block from the body
pub const TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Index of the first CRLFCRLF starting at or after `from`
pub fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < TERMINATOR.len() {
        return None;
    }
    (from..=buf.len() - TERMINATOR.len()).find(|&i| &buf[i..i + TERMINATOR.len()] == TERMINATOR)
}

/// Where the next terminator scan resumes
///
/// The last three bytes are scanned again since the terminator may straddle
/// two reads.
pub fn rescan_offset(len: usize) -> usize {
    len.saturating_sub(TERMINATOR.len() - 1)
}

/// True when the body received so far ends with CRLFCRLF
pub fn body_ends_with_terminator(cache: &[u8], body_index: usize, body_size: usize) -> bool {
    if body_size < TERMINATOR.len() {
        return false;
    }
    let end = body_index + body_size;
    end <= cache.len() && &cache[end - TERMINATOR.len()..end] == TERMINATOR
}

/// Position and progress of a message body inside its cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyCursor {
    /// Offset of the first body byte
    pub index: usize,
    /// Body bytes held so far
    pub size: usize,
    /// Declared Content-Length, or the final size once complete
    pub length: usize,
    pub length_provided: bool,
    /// Where the next terminator scan resumes
    pub scan_from: usize,
}

impl BodyCursor {
    /// Body of `length` bytes starting at `index`, none of it written yet
    pub fn declared(index: usize, length: usize) -> Self {
        BodyCursor {
            index,
            size: 0,
            length,
            length_provided: true,
            scan_from: 0,
        }
    }

    pub fn body<'a>(&self, cache: &'a [u8]) -> &'a [u8] {
        let end = self.end(cache);
        &cache[self.index.min(end)..end]
    }

    /// Bytes past the end of the body
    pub fn surplus<'a>(&self, cache: &'a [u8]) -> &'a [u8] {
        &cache[self.end(cache)..]
    }

    fn end(&self, cache: &[u8]) -> usize {
        (self.index + self.size).min(cache.len())
    }

    /// Forget a Content-Length before the header block is parsed again
    pub fn reset_length(&mut self) {
        self.length = 0;
        self.length_provided = false;
    }

    pub fn set_content_length(&mut self, length: Option<usize>) {
        if let Some(length) = length {
            self.length = length;
            self.length_provided = true;
        }
    }
}

/// Append a read while the header block is incomplete
///
/// Returns the terminator offset once the block is complete, otherwise
/// moves the scan position so the next call does not rescan old bytes.
pub fn feed_header(cache: &mut MemoryBuffer, cursor: &mut BodyCursor, bytes: &[u8]) -> Option<usize> {
    cache.write(bytes);
    let terminator = find_terminator(cache.as_slice(), cursor.scan_from);
    if terminator.is_none() {
        cursor.scan_from = rescan_offset(cache.len());
    }
    terminator
}

/// Place the body right after a parsed header block
///
/// Bytes that arrived with the header block already count as body.
pub fn begin_body(cache: &MemoryBuffer, cursor: &mut BodyCursor, terminator: usize) {
    let length = cache.len();
    cursor.index = terminator + TERMINATOR.len();
    cursor.size = length - cursor.index;
    cursor.scan_from = length;
}

/// Append body bytes; true once the body is complete
///
/// With a Content-Length the body ends after that many bytes and anything
/// past it stays in the cache as surplus. Without one, a `bodyless` message
/// is complete at once and anything else once its bytes end with CRLFCRLF.
pub fn feed_body(cache: &mut MemoryBuffer, cursor: &mut BodyCursor, bytes: &[u8], bodyless: bool) -> bool {
    cache.write(bytes);
    cursor.size += bytes.len();

    if cursor.length_provided {
        if cursor.size >= cursor.length {
            cursor.size = cursor.length;
            return true;
        }
        false
    } else if bodyless {
        cursor.length = 0;
        cursor.size = 0;
        true
    } else if body_ends_with_terminator(cache.as_slice(), cursor.index, cursor.size) {
        cursor.length = cursor.size;
        true
    } else {
        false
    }
}

/// The three fields of a request or status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartLine {
    pub first: String,
    pub second: String,
    pub third: String,
    /// Offset of the first header line
    pub next: usize,
}

/// Split `A SP B SP C CRLF` at the start of a header block
pub fn parse_start_line(block: &[u8]) -> Result<StartLine> {
    let (first, index) = take_until(block, 0, b' ')?;
    let (second, index) = take_until(block, index, b' ')?;
    let (third, index) = take_until(block, index, b'\r')?;
    let next = expect_byte(block, index, b'\n')?;

    Ok(StartLine {
        first,
        second,
        third,
        next,
    })
}

/// Parse `Name: Value CRLF` lines from `index` to the end of the block
///
/// Headers are appended in arrival order. Values of the `cookie_header`
/// header are split into `cookies`. Returns the declared Content-Length, if
/// any (the last declaration wins).
pub fn parse_header_lines(
    block: &[u8],
    mut index: usize,
    cookie_header: &str,
    headers: &mut Headers,
    cookies: &mut Cookies,
) -> Result<Option<usize>> {
    let mut content_length = None;

    while index < block.len() {
        let name_start = index;
        let name_end = block[name_start..]
            .iter()
            .position(|&b| b == b':' || b == b'\r')
            .map(|p| name_start + p)
            .ok_or_else(|| Error::InvalidHeader("unterminated header name".into()))?;

        if block[name_end] != b':' {
            return Err(Error::InvalidHeader("header line without ':'".into()));
        }
        if name_end == name_start {
            return Err(Error::InvalidHeader("empty header name".into()));
        }

        index = name_end + 1;
        while index < block.len() && (block[index] == b' ' || block[index] == b'\t') {
            index += 1;
        }

        let value_start = index;
        let value_end = block[value_start..]
            .iter()
            .position(|&b| b == b'\r')
            .map(|p| value_start + p)
            .ok_or_else(|| Error::InvalidHeader("unterminated header value".into()))?;
        index = expect_byte(block, value_end + 1, b'\n')?;

        let name = String::from_utf8_lossy(&block[name_start..name_end]).into_owned();
        let value_bytes = &block[value_start..value_end];

        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = Some(parse_content_length(value_bytes)?);
        } else if name.eq_ignore_ascii_case(cookie_header) {
            scan_cookies(value_bytes, cookies);
        }

        headers.insert(name, String::from_utf8_lossy(value_bytes).into_owned());
    }

    Ok(content_length)
}

/// Digits only, no sign, no whitespace
pub fn parse_content_length(value: &[u8]) -> Result<usize> {
    if value.is_empty() {
        return Err(Error::InvalidHeader("empty Content-Length".into()));
    }
    value.iter().try_fold(0usize, |acc, &b| {
        if !b.is_ascii_digit() {
            return Err(Error::InvalidHeader(format!(
                "invalid Content-Length: {}",
                String::from_utf8_lossy(value)
            )));
        }
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add((b - b'0') as usize))
            .ok_or_else(|| Error::InvalidHeader("Content-Length overflow".into()))
    })
}

/// Split a `Cookie`/`Set-Cookie` value into (name, value) pairs
///
/// Tokens are delimited by spaces. `=` switches from name to value capture,
/// `;` commits a pending pair (when the token before it was still open) and
/// expects a name again. A trailing token without `;` is committed at the
/// end. Pairs with an empty name or value are dropped.
pub fn scan_cookies(value: &[u8], cookies: &mut Cookies) {
    let mut expect_name = true;
    let mut in_token = false;
    let mut current = 0usize;
    let mut name = 0..0;
    let mut cookie = 0..0;

    for (j, &b) in value.iter().enumerate() {
        match b {
            b' ' | b'=' | b';' => {
                if in_token {
                    if expect_name {
                        name = current..j;
                    } else {
                        cookie = current..j;
                    }
                    if b == b';' && !name.is_empty() && !cookie.is_empty() {
                        push_cookie(value, &name, &cookie, cookies);
                        name = j..j;
                        cookie = j..j;
                    }
                }
                in_token = false;
                match b {
                    b'=' => expect_name = false,
                    b';' => expect_name = true,
                    _ => {}
                }
            }
            _ => {
                if !in_token {
                    current = j;
                    in_token = true;
                }
            }
        }
    }

    if in_token {
        if expect_name {
            name = current..value.len();
        } else {
            cookie = current..value.len();
        }
        if !name.is_empty() && !cookie.is_empty() {
            push_cookie(value, &name, &cookie, cookies);
        }
    }
}

fn push_cookie(
    value: &[u8],
    name: &std::ops::Range<usize>,
    cookie: &std::ops::Range<usize>,
    cookies: &mut Cookies,
) {
    cookies.insert(
        String::from_utf8_lossy(&value[name.clone()]).into_owned(),
        String::from_utf8_lossy(&value[cookie.clone()]).into_owned(),
    );
}

fn take_until(block: &[u8], start: usize, delimiter: u8) -> Result<(String, usize)> {
    let end = block
        .get(start..)
        .and_then(|rest| rest.iter().position(|&b| b == delimiter))
        .map(|p| start + p)
        .ok_or_else(|| Error::Parse("truncated start line".into()))?;
    Ok((
        String::from_utf8_lossy(&block[start..end]).into_owned(),
        end + 1,
    ))
}

fn expect_byte(block: &[u8], index: usize, expected: u8) -> Result<usize> {
    match block.get(index) {
        Some(&b) if b == expected => Ok(index + 1),
        _ => Err(Error::Parse(format!(
            "expected {:?} at offset {}",
            expected as char, index
        ))),
    }
}

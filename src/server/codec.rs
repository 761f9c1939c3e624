//! HTTP/1.x wire codec.
//!
//! [`parse`] turns the front of a read buffer into a [`Request`] (or reports
//! that more bytes are needed), and [`write`] / [`write_head`] serialize a
//! [`Response`]. Both are pure functions over byte slices; the connection loop
//! owns the socket and the buffer.

use http::{Method, Version};
use memchr::memmem;
use std::collections::HashMap;
use std::fmt;

use super::request::{parse_query_params, split_target, Request};
use super::response::{canonical_header_name, status_reason, Response};

/// Sent verbatim when the connection backlog is full.
pub const SERVICE_UNAVAILABLE: &[u8] = concat!(
    "HTTP/1.1 503 Service Unavailable\r\n",
    "Content-Type: application/json\r\n",
    "Connection: close\r\n",
    "Content-Length: 62\r\n",
    "\r\n",
    r#"{"error":"Server is at capacity","code":"SERVICE_UNAVAILABLE"}"#
)
.as_bytes();

/// Size limits applied while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum size of the start-line plus headers, terminator included
    pub max_header_bytes: usize,
    /// Maximum accepted `Content-Length`
    pub max_body_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Outcome of a successful [`parse`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A full request was parsed from the first `consumed` bytes of the buffer
    Complete {
        /// The parsed request
        request: Request,
        /// Bytes belonging to this request; anything after is the next request
        consumed: usize,
    },
    /// The buffer does not hold a full request yet
    Incomplete,
}

/// Malformed or oversized request. Always answered with 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Start-line without three space-separated tokens, or not UTF-8
    InvalidRequestLine,
    /// Method outside GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS
    UnsupportedMethod,
    /// Request target does not start with `/`
    InvalidTarget,
    /// Version other than HTTP/1.0 or HTTP/1.1
    UnsupportedVersion,
    /// Header line without a colon, with a bad name, or a non-UTF-8 value
    InvalidHeader,
    /// Negative, non-numeric or conflicting `Content-Length`
    InvalidContentLength,
    /// `Transfer-Encoding` other than `identity`
    UnsupportedTransferEncoding,
    /// Header section exceeds `max_header_bytes`
    HeadersTooLarge,
    /// `Content-Length` exceeds `max_body_bytes`
    BodyTooLarge,
}

impl ProtocolError {
    /// Machine-readable code used in the JSON error body
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidRequestLine
            | ProtocolError::UnsupportedMethod
            | ProtocolError::InvalidTarget
            | ProtocolError::UnsupportedVersion => "INVALID_REQUEST_LINE",
            ProtocolError::InvalidHeader => "INVALID_HEADER",
            ProtocolError::InvalidContentLength => "INVALID_CONTENT_LENGTH",
            ProtocolError::UnsupportedTransferEncoding => "UNSUPPORTED_TRANSFER_ENCODING",
            ProtocolError::HeadersTooLarge => "HEADERS_TOO_LARGE",
            ProtocolError::BodyTooLarge => "BODY_TOO_LARGE",
        }
    }

    /// The 400 response sent for this error
    #[must_use]
    pub fn to_response(&self) -> Response {
        Response::error(400, self.code(), &self.to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ProtocolError::InvalidRequestLine => "Invalid request line",
            ProtocolError::UnsupportedMethod => "Unsupported HTTP method",
            ProtocolError::InvalidTarget => "Request target must start with '/'",
            ProtocolError::UnsupportedVersion => "Unsupported HTTP version",
            ProtocolError::InvalidHeader => "Invalid header line",
            ProtocolError::InvalidContentLength => "Invalid Content-Length",
            ProtocolError::UnsupportedTransferEncoding => "Unsupported Transfer-Encoding",
            ProtocolError::HeadersTooLarge => "Request headers too large",
            ProtocolError::BodyTooLarge => "Request body too large",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ProtocolError {}

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse one request from the front of `buf`.
///
/// # Errors
///
/// Returns a [`ProtocolError`] as soon as the bytes seen so far cannot be a
/// valid request. A complete start-line is validated even before the header
/// terminator arrives.
///
/// Empty lines ahead of the request-line are skipped and counted in
/// `consumed`, as RFC 9112 asks of servers.
pub fn parse(buf: &[u8], limits: &ParseLimits) -> Result<Parsed, ProtocolError> {
    let mut skip = 0;
    while buf[skip..].starts_with(CRLF) {
        skip += CRLF.len();
    }
    if skip > limits.max_header_bytes {
        return Err(ProtocolError::HeadersTooLarge);
    }

    Ok(match parse_message(&buf[skip..], limits)? {
        Parsed::Complete { request, consumed } => Parsed::Complete {
            request,
            consumed: skip + consumed,
        },
        Parsed::Incomplete => Parsed::Incomplete,
    })
}

fn parse_message(buf: &[u8], limits: &ParseLimits) -> Result<Parsed, ProtocolError> {
    let Some(head_end) = memmem::find(buf, HEADER_END) else {
        if let Some(line_end) = memmem::find(buf, CRLF) {
            parse_request_line(&buf[..line_end])?;
        }
        if buf.len() > limits.max_header_bytes {
            return Err(ProtocolError::HeadersTooLarge);
        }
        return Ok(Parsed::Incomplete);
    };
    if head_end + HEADER_END.len() > limits.max_header_bytes {
        return Err(ProtocolError::HeadersTooLarge);
    }

    let head = &buf[..head_end];
    let mut lines = memmem::find_iter(head, CRLF);
    let line_end = lines.next().unwrap_or(head.len());
    let (method, target, version) = parse_request_line(&head[..line_end])?;

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut content_length: Option<usize> = None;
    let mut start = line_end + CRLF.len();
    while start < head.len() {
        let end = lines.next().unwrap_or(head.len());
        let (name, value) = parse_header_line(&head[start..end])?;
        if name == "content-length" {
            let len = parse_content_length(value)?;
            if content_length.is_some_and(|prev| prev != len) {
                return Err(ProtocolError::InvalidContentLength);
            }
            content_length = Some(len);
            headers.insert(name, value.to_string());
        } else {
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        start = end + CRLF.len();
    }

    if let Some(te) = headers.get("transfer-encoding") {
        if !te.trim().eq_ignore_ascii_case("identity") {
            return Err(ProtocolError::UnsupportedTransferEncoding);
        }
    }

    let body_len = content_length.unwrap_or(0);
    if body_len > limits.max_body_bytes {
        return Err(ProtocolError::BodyTooLarge);
    }

    let body_start = head_end + HEADER_END.len();
    let consumed = body_start + body_len;
    if buf.len() < consumed {
        return Ok(Parsed::Incomplete);
    }

    let (path, query) = split_target(target);
    Ok(Parsed::Complete {
        request: Request {
            method,
            path: path.to_string(),
            query_params: parse_query_params(query),
            headers,
            body: buf[body_start..consumed].to_vec(),
            version,
        },
        consumed,
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, &str, Version), ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::InvalidRequestLine);
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ProtocolError::InvalidRequestLine);
    }

    let method = match method {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "PATCH" => Method::PATCH,
        "DELETE" => Method::DELETE,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        _ => return Err(ProtocolError::UnsupportedMethod),
    };
    if !target.starts_with('/') {
        return Err(ProtocolError::InvalidTarget);
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(ProtocolError::UnsupportedVersion),
    };
    Ok((method, target, version))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_header_line(line: &[u8]) -> Result<(String, &str), ProtocolError> {
    let colon = memchr::memchr(b':', line).ok_or(ProtocolError::InvalidHeader)?;
    let name = &line[..colon];
    // Also rejects obsolete line folding, which starts with whitespace
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(ProtocolError::InvalidHeader);
    }
    let value = std::str::from_utf8(&line[colon + 1..]).map_err(|_| ProtocolError::InvalidHeader)?;
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    // Token bytes are ASCII, so this cannot fail
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    Ok((name, value))
}

fn parse_content_length(value: &str) -> Result<usize, ProtocolError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidContentLength);
    }
    value
        .parse::<usize>()
        .map_err(|_| ProtocolError::InvalidContentLength)
}

/// Serialize a full response: status line, headers, `Content-Length`, body.
///
/// Any `content-length` or `transfer-encoding` header on the response is
/// replaced by a `Content-Length` computed from the body.
#[must_use]
pub fn write(resp: &Response) -> Vec<u8> {
    let mut out = write_head(resp);
    out.extend_from_slice(&resp.body);
    out
}

/// Serialize a response without its body, as sent for HEAD requests.
///
/// `Content-Length` still describes the body that a GET would have returned.
#[must_use]
pub fn write_head(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + resp.headers.len() * 32 + resp.body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(resp.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_reason(resp.status).as_bytes());
    out.extend_from_slice(CRLF);

    for (name, value) in &resp.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        out.extend_from_slice(canonical_header_name(name).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(CRLF);
    }

    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(resp.body.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(CRLF);
    out
}

use serde_json::{json, Value};
use smallvec::SmallVec;
use std::sync::Arc;

/// Maximum number of response headers before heap allocation.
/// Typical responses carry content-type, connection and x-request-id.
pub const MAX_INLINE_HEADERS: usize = 8;

/// Stack-allocated header storage, in insertion order.
///
/// Names are stored lower-cased and compared case-insensitively; the codec
/// canonicalizes them on the way out.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// An HTTP response ready to be written by [`crate::server::codec::write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code (100-599)
    pub status: u16,
    /// Response headers in insertion order
    pub headers: HeaderVec,
    /// Body bytes
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response with the given status
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderVec::new(),
            body: Vec::new(),
        }
    }

    /// A response carrying `body` with the given content type
    #[must_use]
    pub fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("content-type", content_type);
        resp.body = body;
        resp
    }

    /// A JSON response
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        // A `Value` always has string keys, so serialization cannot fail
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        Self::with_body(status, "application/json", bytes)
    }

    /// A JSON error response: `{"error": message, "code": code}`
    #[must_use]
    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self::json(status, &json!({ "error": message, "code": code }))
    }

    /// Get a header by name (case-insensitive)
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, overwriting an existing one of the same name in place
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.headers
                .push((Arc::from(name.to_ascii_lowercase()), value));
        }
    }

    /// The `content-type` header, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get_header("content-type")
    }
}

/// Reason phrase for a status code
pub fn status_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Canonical header casing: `content-type` -> `Content-Type`
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reason() {
        assert_eq!(status_reason(200), "OK");
        assert_eq!(status_reason(404), "Not Found");
        assert_eq!(status_reason(405), "Method Not Allowed");
        assert_eq!(status_reason(503), "Service Unavailable");
        assert_eq!(status_reason(599), "Unknown");
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("X-REQUEST-ID"), "X-Request-Id");
        assert_eq!(canonical_header_name("allow"), "Allow");
    }

    #[test]
    fn test_set_header_overwrites_in_place() {
        let mut resp = Response::new(200);
        resp.set_header("Content-Type", "text/plain");
        resp.set_header("x-extra", "1");
        resp.set_header("content-type", "application/json");

        assert_eq!(resp.headers.len(), 2);
        assert_eq!(resp.headers[0].0.as_ref(), "content-type");
        assert_eq!(resp.content_type(), Some("application/json"));
    }

    #[test]
    fn test_error_body_shape() {
        let resp = Response::error(404, "NOT_FOUND", "Not Found");
        let body: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body, json!({"error": "Not Found", "code": "NOT_FOUND"}));
        assert_eq!(resp.content_type(), Some("application/json"));
    }
}

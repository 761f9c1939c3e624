use http::{Method, Version};
use std::collections::HashMap;

/// A parsed HTTP request.
///
/// Produced by [`crate::server::codec::parse`] and owned by a single iteration of
/// the connection loop. Header names are lower-cased; repeated headers are
/// joined with `", "`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method (one of GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS)
    pub method: Method,
    /// Request path without the query string, always starting with `/`
    pub path: String,
    /// Parsed query string parameters (last occurrence wins)
    pub query_params: HashMap<String, String>,
    /// HTTP headers (lowercase keys)
    pub headers: HashMap<String, String>,
    /// Raw body bytes, exactly `Content-Length` long
    pub body: Vec<u8>,
    /// HTTP/1.0 or HTTP/1.1
    pub version: Version,
}

impl Request {
    /// Build a request by hand, mostly useful in tests and for in-process dispatch
    #[must_use]
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path: path.to_string(),
            query_params: parse_query_params(query),
            headers: HashMap::new(),
            body: Vec::new(),
            version: Version::HTTP_11,
        }
    }

    /// Attach a header (name is lower-cased)
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Attach a body and the matching `content-length` header
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers
            .insert("content-length".to_string(), self.body.len().to_string());
        self
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        // Keys are stored lower-cased; only mixed-case lookups pay for a copy
        let value = if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.headers.get(&name.to_ascii_lowercase())
        } else {
            self.headers.get(name)
        };
        value.map(String::as_str)
    }

    /// Get a query parameter by name
    #[inline]
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// The `content-type` header, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the client allows the connection to stay open after this request.
    ///
    /// `Connection: close` always wins. HTTP/1.0 needs an explicit
    /// `Connection: keep-alive`; HTTP/1.1 is persistent by default.
    #[must_use]
    pub fn wants_keep_alive(&self) -> bool {
        let tokens = || {
            self.header("connection")
                .into_iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
        };
        if tokens().any(|t| t.eq_ignore_ascii_case("close")) {
            return false;
        }
        if self.version == Version::HTTP_10 {
            return tokens().any(|t| t.eq_ignore_ascii_case("keep-alive"));
        }
        true
    }
}

/// Split a request target into path and query string
#[inline]
pub(crate) fn split_target(target: &str) -> (&str, &str) {
    target.split_once('?').unwrap_or((target, ""))
}

/// Parse a query string (`a=1&b=2`) into a map.
///
/// Names and values are form-urlencoded decoded. When a name repeats, the last
/// occurrence wins.
pub fn parse_query_params(query: &str) -> HashMap<String, String> {
    if query.is_empty() {
        return HashMap::new();
    }
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_params() {
        let q = parse_query_params("x=1&y=hello%20world&flag");
        assert_eq!(q.get("x"), Some(&"1".to_string()));
        assert_eq!(q.get("y"), Some(&"hello world".to_string()));
        assert_eq!(q.get("flag"), Some(&String::new()));
    }

    #[test]
    fn test_duplicate_query_keys_last_wins() {
        let q = parse_query_params("limit=10&limit=20");
        assert_eq!(q.get("limit"), Some(&"20".to_string()));
    }

    #[test]
    fn test_new_splits_target() {
        let req = Request::new(Method::GET, "/items?page=2");
        assert_eq!(req.path, "/items");
        assert_eq!(req.query("page"), Some("2"));
    }

    #[test]
    fn test_keep_alive_rules() {
        let req = Request::new(Method::GET, "/");
        assert!(req.wants_keep_alive());

        let req = Request::new(Method::GET, "/").with_header("Connection", "Close");
        assert!(!req.wants_keep_alive());

        let mut req = Request::new(Method::GET, "/");
        req.version = Version::HTTP_10;
        assert!(!req.wants_keep_alive());

        let req = req.with_header("connection", "keep-alive");
        assert!(req.wants_keep_alive());

        let req = Request::new(Method::GET, "/").with_header("connection", "keep-alive, close");
        assert!(!req.wants_keep_alive());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = Request::new(Method::POST, "/").with_header("Content-Type", "application/json");
        assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(req.content_type(), Some("application/json"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("Content-Length"), None);
    }
}

//! # Router Module
//!
//! The router module provides path matching and route resolution.
//!
//! ## Overview
//!
//! The router is responsible for:
//! - Registering `(method, path template)` pairs with a handler at startup
//! - Matching incoming requests to registered routes
//! - Extracting path parameters from matched routes
//! - Telling a 404 apart from a 405 (the path exists under another method)
//!
//! ## Architecture
//!
//! Every method owns a radix tree keyed by path segment. A node has literal
//! children plus at most one `{param}` child, and literal children are always
//! tried first, so `/items/active` beats `/items/{id}` deterministically.
//!
//! ## Example
//!
//! ```rust
//! use brrtserve::router::{Resolution, Router};
//! use http::Method;
//!
//! let mut router = Router::new();
//! router.register(Method::GET, "/items/active", "active_items").unwrap();
//! router.register(Method::GET, "/items/{id}", "get_item").unwrap();
//!
//! match router.resolve(&Method::GET, "/items/42") {
//!     Resolution::Matched(m) => {
//!         assert_eq!(*m.handler, "get_item");
//!         assert_eq!(m.get_path_param("id"), Some("42"));
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```
//!
//! ## Performance
//!
//! Matching walks one node per path segment, so its cost follows the depth of
//! the request path rather than the number of registered routes.

mod core;
mod radix;

pub use self::core::{ParamVec, Resolution, RouteError, RouteMatch, Router, MAX_INLINE_PARAMS, SUPPORTED_METHODS};

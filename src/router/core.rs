//! Router core module - hot path for request routing.

#![deny(clippy::inefficient_to_string)]
#![deny(clippy::format_push_string)]
#![deny(clippy::unnecessary_to_owned)]

use http::Method;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::radix::{parse_template, split_path, RadixTree};

/// Maximum number of path parameters before heap allocation.
/// Most REST APIs have ≤4 path params (e.g., /users/{id}/posts/{postId}).
pub const MAX_INLINE_PARAMS: usize = 8;

/// Stack-allocated parameter storage for the hot path.
///
/// Param names use `Arc<str>` because they come from the static route tree;
/// values are per-request data copied out of the URL.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;

/// Methods a route may be registered for, in the order used for `Allow` headers
pub const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
];

/// Configuration error raised while registering a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The same method and template were registered twice
    Duplicate {
        /// Method of the rejected route
        method: Method,
        /// Template of the rejected route
        template: String,
    },
    /// Two templates put differently named parameters at the same position
    ConflictingParameter {
        /// Method of the rejected route
        method: Method,
        /// Template of the rejected route
        template: String,
        /// Parameter name already registered at that position
        existing: String,
        /// Parameter name the rejected template uses there
        found: String,
    },
    /// The template could not be parsed
    InvalidTemplate {
        /// The offending template
        template: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// The method is outside the supported set
    UnsupportedMethod(Method),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Duplicate { method, template } => {
                write!(f, "route {method} {template} is registered more than once")
            }
            RouteError::ConflictingParameter {
                method,
                template,
                existing,
                found,
            } => write!(
                f,
                "route {method} {template} declares parameter '{{{found}}}' where '{{{existing}}}' \
                 is already registered"
            ),
            RouteError::InvalidTemplate { template, reason } => {
                write!(f, "invalid path template '{template}': {reason}")
            }
            RouteError::UnsupportedMethod(method) => {
                write!(f, "method {method} is not supported for routing")
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Result of successfully matching a request path to a route
#[derive(Debug, Clone)]
pub struct RouteMatch<'a, H> {
    /// The handler registered for the matched template
    pub handler: &'a H,
    /// Path parameters extracted from the URL (e.g., `{id}` → `{"id": "123"}`)
    pub path_params: ParamVec,
}

impl<H> RouteMatch<'_, H> {
    /// Get a path parameter by name
    #[inline]
    #[must_use]
    pub fn get_path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of [`Router::resolve`]
#[derive(Debug, Clone)]
pub enum Resolution<'a, H> {
    /// A route for this method matched every segment
    Matched(RouteMatch<'a, H>),
    /// The path exists, but only under other methods
    MethodNotAllowed {
        /// Methods the path is registered for, in [`SUPPORTED_METHODS`] order
        allowed: Vec<Method>,
    },
    /// No route matches the path under any method
    NotFound,
}

/// Router that matches HTTP requests to handlers using one radix tree per method
///
/// Built once at startup and read-only afterwards, so it can be shared between
/// worker threads without locking.
///
/// # Performance
///
/// - Route matching: O(k) where k is the number of path segments, independent
///   of how many routes are registered
/// - Backtracking from a literal branch into a parameter branch only happens
///   where literal and parameterized templates overlap
#[derive(Debug, Clone)]
pub struct Router<H> {
    trees: HashMap<Method, RadixTree<H>>,
    /// Registration order, kept for route listings
    routes: Vec<(Method, String)>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Router<H> {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Self {
        Self {
            trees: HashMap::new(),
            routes: Vec::new(),
        }
    }

    /// Register `handler` for `method` and `template`
    ///
    /// # Errors
    ///
    /// - [`RouteError::UnsupportedMethod`] for methods outside [`SUPPORTED_METHODS`]
    /// - [`RouteError::InvalidTemplate`] for templates that do not start with `/`
    ///   or carry malformed `{name}` placeholders
    /// - [`RouteError::Duplicate`] when the method and template are already taken
    /// - [`RouteError::ConflictingParameter`] when another template of the same
    ///   method names the parameter at some position differently
    pub fn register(&mut self, method: Method, template: &str, handler: H) -> Result<(), RouteError> {
        if !SUPPORTED_METHODS.contains(&method) {
            return Err(RouteError::UnsupportedMethod(method));
        }
        let segments = parse_template(template)?;
        self.trees
            .entry(method.clone())
            .or_default()
            .insert(&method, template, &segments, handler)?;

        debug!(method = %method, template = %template, "Route registered");
        self.routes.push((method, template.to_string()));
        Ok(())
    }

    /// Resolve a concrete method and path to a handler and its path parameters
    ///
    /// Literal segments take precedence over parameters at every level. Every
    /// path segment must be consumed; there is no prefix fallback and trailing
    /// slashes are significant.
    #[must_use]
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_, H> {
        let match_start = std::time::Instant::now();
        let segments: SmallVec<[&str; MAX_INLINE_PARAMS]> = split_path(path).collect();

        let mut params = ParamVec::new();
        if let Some(handler) = self
            .trees
            .get(method)
            .and_then(|tree| tree.lookup(&segments, &mut params))
        {
            let match_duration = match_start.elapsed();
            if match_duration > std::time::Duration::from_millis(1) {
                warn!(
                    method = %method,
                    path = %path,
                    duration_us = match_duration.as_micros(),
                    "Slow route matching detected"
                );
            }
            return Resolution::Matched(RouteMatch {
                handler,
                path_params: params,
            });
        }

        let allowed: Vec<Method> = SUPPORTED_METHODS
            .iter()
            .filter(|candidate| *candidate != method)
            .filter(|candidate| {
                self.trees.get(*candidate).is_some_and(|tree| {
                    let mut scratch = ParamVec::new();
                    tree.lookup(&segments, &mut scratch).is_some()
                })
            })
            .cloned()
            .collect();

        if allowed.is_empty() {
            debug!(method = %method, path = %path, "No route matched");
            Resolution::NotFound
        } else {
            debug!(method = %method, path = %path, allowed = ?allowed, "Path matched under other methods");
            Resolution::MethodNotAllowed { allowed }
        }
    }

    /// Registered `(method, template)` pairs in registration order
    pub fn routes(&self) -> impl Iterator<Item = (&Method, &str)> {
        self.routes.iter().map(|(m, t)| (m, t.as_str()))
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.values().map(RadixTree::len).sum()
    }

    /// Whether no route has been registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Print all registered routes to stdout
    pub fn dump_routes(&self) {
        println!("[routes] count={}", self.routes.len());
        for (method, template) in &self.routes {
            println!("[route] {method} {template}");
        }
    }
}

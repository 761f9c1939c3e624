//! Handler argument resolution.
//!
//! Every handler and provider declares its inputs as a list of [`Param`]s.
//! [`resolve`] walks that list in order and produces [`Args`]: path and query
//! parameters are converted to their declared [`Primitive`], the body goes
//! through the [`BodyDecoder`], and provider results are computed on first use
//! and then served from the per-request [`DependencyCache`].

use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::core::{ConfigError, HandlerError};
use super::decode::{Arg, BodyDecoder, BodyType, ValidationError};
use crate::router::ParamVec;
use crate::server::{Request, Response};

/// Scalar kinds path and query parameters can be converted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// `i64`
    Int,
    /// `f64`
    Float,
    /// `String`, passed through unchanged
    Str,
    /// `bool`; accepts `true`, `false`, `1` and `0`, case-insensitively
    Bool,
}

impl Primitive {
    /// Convert a raw string, or `None` when it is not a valid value of this kind
    #[must_use]
    pub fn convert(self, raw: &str) -> Option<Arg> {
        match self {
            Primitive::Int => raw.parse::<i64>().ok().map(|v| Arc::new(v) as Arg),
            Primitive::Float => raw.parse::<f64>().ok().map(|v| Arc::new(v) as Arg),
            Primitive::Str => Some(Arc::new(raw.to_string())),
            Primitive::Bool => {
                if raw.eq_ignore_ascii_case("true") || raw == "1" {
                    Some(Arc::new(true))
                } else if raw.eq_ignore_ascii_case("false") || raw == "0" {
                    Some(Arc::new(false))
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Str => "string",
            Primitive::Bool => "bool",
        })
    }
}

/// Declared input of a handler or provider
#[derive(Debug, Clone)]
pub enum Param {
    /// A `{name}` segment of the route template
    Path {
        /// Template parameter name
        name: Arc<str>,
        /// Target kind
        kind: Primitive,
    },
    /// A query string parameter
    Query {
        /// Query parameter name
        name: Arc<str>,
        /// Target kind
        kind: Primitive,
        /// Raw value used when the parameter is absent
        default: Option<String>,
    },
    /// The request body
    Body {
        /// Argument name
        name: Arc<str>,
        /// What the body decodes into
        ty: BodyType,
    },
    /// The result of a registered provider
    Depends {
        /// Argument name
        name: Arc<str>,
        /// Provider name as passed to [`crate::App::provide`]
        provider: Arc<str>,
    },
}

impl Param {
    /// Path parameter `name` converted to `kind`
    #[must_use]
    pub fn path(name: &str, kind: Primitive) -> Self {
        Param::Path {
            name: Arc::from(name),
            kind,
        }
    }

    /// Required query parameter
    #[must_use]
    pub fn query(name: &str, kind: Primitive) -> Self {
        Param::Query {
            name: Arc::from(name),
            kind,
            default: None,
        }
    }

    /// Optional query parameter; `default` is converted like a received value
    #[must_use]
    pub fn query_or(name: &str, kind: Primitive, default: &str) -> Self {
        Param::Query {
            name: Arc::from(name),
            kind,
            default: Some(default.to_string()),
        }
    }

    /// Request body decoded as `ty`
    #[must_use]
    pub fn body(name: &str, ty: BodyType) -> Self {
        Param::Body {
            name: Arc::from(name),
            ty,
        }
    }

    /// Result of the provider registered as `provider`
    #[must_use]
    pub fn depends(name: &str, provider: &str) -> Self {
        Param::Depends {
            name: Arc::from(name),
            provider: Arc::from(provider),
        }
    }

    /// Argument name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Param::Path { name, .. }
            | Param::Query { name, .. }
            | Param::Body { name, .. }
            | Param::Depends { name, .. } => name,
        }
    }
}

/// Wrong use of [`Args`] inside a handler. Answered with a 500.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    /// No argument at this position or with this name
    Missing(String),
    /// The argument exists but holds another type
    WrongType {
        /// Argument name
        name: String,
        /// Type the handler asked for
        expected: &'static str,
    },
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgError::Missing(name) => write!(f, "no argument '{name}'"),
            ArgError::WrongType { name, expected } => {
                write!(f, "argument '{name}' is not a {expected}")
            }
        }
    }
}

impl std::error::Error for ArgError {}

/// Resolved arguments, in declaration order
#[derive(Clone, Default)]
pub struct Args {
    entries: Vec<(Arc<str>, Arg)>,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl Args {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, name: Arc<str>, value: Arg) {
        self.entries.push((name, value));
    }

    /// Argument at `index`
    ///
    /// # Errors
    ///
    /// [`ArgError`] when the index is out of range or the type differs.
    pub fn get<T: Any>(&self, index: usize) -> Result<&T, ArgError> {
        let (name, value) = self
            .entries
            .get(index)
            .ok_or_else(|| ArgError::Missing(format!("#{index}")))?;
        downcast(name, value)
    }

    /// Argument declared as `name`
    ///
    /// # Errors
    ///
    /// [`ArgError`] when no such argument exists or the type differs.
    pub fn named<T: Any>(&self, name: &str) -> Result<&T, ArgError> {
        let (name, value) = self
            .entries
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .ok_or_else(|| ArgError::Missing(name.to_string()))?;
        downcast(name, value)
    }

    /// Number of arguments
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no arguments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn downcast<'a, T: Any>(name: &str, value: &'a Arg) -> Result<&'a T, ArgError> {
    value.downcast_ref::<T>().ok_or_else(|| ArgError::WrongType {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
    })
}

/// Provider results computed while handling one request.
///
/// Created empty for every request and dropped with it, so a provider runs at
/// most once per request and never shares a result across requests.
#[derive(Default)]
pub struct DependencyCache {
    values: HashMap<usize, Arg>,
}

impl DependencyCache {
    /// An empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of providers evaluated so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no provider has been evaluated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Where a scalar parameter comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Route template segment
    Path,
    /// Query string
    Query,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Location::Path => "path",
            Location::Query => "query",
        })
    }
}

/// Why the arguments for a request could not be assembled
#[derive(Debug, Clone)]
pub enum ResolutionError {
    /// A path or query value does not convert to the declared kind
    TypeMismatch {
        /// Parameter name
        name: String,
        /// Where it came from
        location: Location,
        /// Declared kind
        expected: Primitive,
        /// Received value
        value: String,
    },
    /// A required parameter is absent
    MissingParameter {
        /// Parameter name
        name: String,
        /// Where it was expected
        location: Location,
    },
    /// The body decoder rejected the body
    ValidationFailed(ValidationError),
    /// A provider returned an error
    Provider {
        /// Provider name
        provider: String,
        /// Its error
        error: HandlerError,
    },
    /// A provider name that is not registered; prevented by [`crate::App::build`]
    UnknownProvider(String),
}

impl ResolutionError {
    /// The error response for this failure
    #[must_use]
    pub fn to_response(&self) -> Response {
        match self {
            ResolutionError::TypeMismatch { .. } => Response::error(400, "TYPE_MISMATCH", &self.to_string()),
            ResolutionError::MissingParameter { .. } => {
                Response::error(400, "MISSING_PARAMETER", &self.to_string())
            }
            ResolutionError::ValidationFailed(err) => Response::json(
                400,
                &json!({
                    "error": "Request validation failed",
                    "code": "VALIDATION_FAILED",
                    "fields": err.fields,
                }),
            ),
            ResolutionError::Provider { error, .. } => error.to_response(),
            ResolutionError::UnknownProvider(_) => {
                Response::error(500, "INTERNAL_ERROR", "Internal Server Error")
            }
        }
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionError::TypeMismatch {
                name,
                location,
                expected,
                value,
            } => write!(f, "{location} parameter '{name}' must be {expected}, got '{value}'"),
            ResolutionError::MissingParameter { name, location } => {
                write!(f, "missing required {location} parameter '{name}'")
            }
            ResolutionError::ValidationFailed(err) => fmt::Display::fmt(err, f),
            ResolutionError::Provider { provider, error } => {
                write!(f, "provider '{provider}' failed: {error}")
            }
            ResolutionError::UnknownProvider(name) => write!(f, "unknown provider '{name}'"),
        }
    }
}

impl std::error::Error for ResolutionError {}

pub(crate) type ProviderFn = dyn Fn(&Request, &Args) -> Result<Arg, HandlerError> + Send + Sync;

/// A registered dependency provider
pub(crate) struct Provider {
    pub(crate) name: Arc<str>,
    pub(crate) params: Vec<Param>,
    pub(crate) func: Box<ProviderFn>,
}

/// All providers of an application, validated to form a DAG
#[derive(Default)]
pub struct ProviderGraph {
    providers: Vec<Provider>,
    index: HashMap<Arc<str>, usize>,
}

impl fmt::Debug for ProviderGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| &p.name))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

impl ProviderGraph {
    /// Index the providers and reject duplicates, dangling references and cycles
    pub(crate) fn build(providers: Vec<Provider>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(providers.len());
        for (id, provider) in providers.iter().enumerate() {
            if index.insert(Arc::clone(&provider.name), id).is_some() {
                return Err(ConfigError::DuplicateProvider(provider.name.to_string()));
            }
        }
        let graph = Self { providers, index };

        for provider in &graph.providers {
            graph.check_references(&provider.params, &provider.name)?;
        }

        let mut marks = vec![Mark::New; graph.providers.len()];
        let mut stack = Vec::new();
        for id in 0..graph.providers.len() {
            graph.visit(id, &mut marks, &mut stack)?;
        }
        Ok(graph)
    }

    /// Fail when `params` names a provider that is not registered
    pub(crate) fn check_references(&self, params: &[Param], owner: &str) -> Result<(), ConfigError> {
        for param in params {
            if let Param::Depends { provider, .. } = param {
                if !self.index.contains_key(provider) {
                    return Err(ConfigError::UnknownProvider {
                        provider: provider.to_string(),
                        required_by: owner.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn visit(&self, id: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Result<(), ConfigError> {
        match marks[id] {
            Mark::Done => return Ok(()),
            Mark::Active => {
                let start = stack.iter().position(|&s| s == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|&s| self.providers[s].name.to_string())
                    .collect();
                cycle.push(self.providers[id].name.to_string());
                return Err(ConfigError::DependencyCycle(cycle));
            }
            Mark::New => {}
        }

        marks[id] = Mark::Active;
        stack.push(id);
        for param in &self.providers[id].params {
            if let Param::Depends { provider, .. } = param {
                if let Some(&dep) = self.index.get(provider) {
                    self.visit(dep, marks, stack)?;
                }
            }
        }
        stack.pop();
        marks[id] = Mark::Done;
        Ok(())
    }

    /// Path parameter names needed by `params`, including those of every provider they reach
    pub(crate) fn path_params_needed<'a>(&'a self, params: &'a [Param], out: &mut Vec<&'a str>) {
        for param in params {
            match param {
                Param::Path { name, .. } => {
                    if !out.contains(&name.as_ref()) {
                        out.push(name);
                    }
                }
                Param::Depends { provider, .. } => {
                    if let Some(&id) = self.index.get(provider) {
                        self.path_params_needed(&self.providers[id].params, out);
                    }
                }
                Param::Query { .. } | Param::Body { .. } => {}
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<(usize, &Provider)> {
        let id = *self.index.get(name)?;
        self.providers.get(id).map(|p| (id, p))
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name.as_ref())
    }
}

/// Everything resolution needs besides the request itself
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Registered providers
    pub providers: &'a ProviderGraph,
    /// Decoder for `Param::Body`
    pub decoder: &'a dyn BodyDecoder,
}

/// Assemble the arguments declared by `params` for one request.
///
/// Parameters are resolved in declaration order and the first failure aborts
/// the whole resolution; providers after it are not invoked.
///
/// # Errors
///
/// See [`ResolutionError`].
pub fn resolve(
    params: &[Param],
    request: &Request,
    route_params: &ParamVec,
    ctx: ResolveContext<'_>,
    cache: &mut DependencyCache,
) -> Result<Args, ResolutionError> {
    let mut args = Args::with_capacity(params.len());
    for param in params {
        let value = match param {
            Param::Path { name, kind } => {
                let raw = route_params
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
                    .ok_or_else(|| ResolutionError::MissingParameter {
                        name: name.to_string(),
                        location: Location::Path,
                    })?;
                convert(name, *kind, raw, Location::Path)?
            }
            Param::Query { name, kind, default } => {
                match request.query(name).or(default.as_deref()) {
                    Some(raw) => convert(name, *kind, raw, Location::Query)?,
                    None => {
                        return Err(ResolutionError::MissingParameter {
                            name: name.to_string(),
                            location: Location::Query,
                        })
                    }
                }
            }
            Param::Body { ty, .. } => ctx
                .decoder
                .decode(&request.body, ty)
                .map_err(ResolutionError::ValidationFailed)?,
            Param::Depends { provider, .. } => resolve_provider(provider, request, route_params, ctx, cache)?,
        };
        args.push(Arc::from(param.name()), value);
    }
    Ok(args)
}

fn convert(name: &str, kind: Primitive, raw: &str, location: Location) -> Result<Arg, ResolutionError> {
    kind.convert(raw).ok_or_else(|| ResolutionError::TypeMismatch {
        name: name.to_string(),
        location,
        expected: kind,
        value: raw.to_string(),
    })
}

fn resolve_provider(
    name: &str,
    request: &Request,
    route_params: &ParamVec,
    ctx: ResolveContext<'_>,
    cache: &mut DependencyCache,
) -> Result<Arg, ResolutionError> {
    let (id, provider) = ctx
        .providers
        .lookup(name)
        .ok_or_else(|| ResolutionError::UnknownProvider(name.to_string()))?;
    if let Some(hit) = cache.values.get(&id) {
        return Ok(Arc::clone(hit));
    }

    let args = resolve(&provider.params, request, route_params, ctx, cache)?;
    let value = (provider.func)(request, &args).map_err(|error| {
        debug!(provider = %name, error = %error, "Provider failed");
        ResolutionError::Provider {
            provider: name.to_string(),
            error,
        }
    })?;
    cache.values.insert(id, Arc::clone(&value));
    Ok(value)
}

//! Dispatcher core module - turns one request into one response.

use http::Method;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::decode::{Arg, BodyDecoder, JsonBodyDecoder};
use super::resolver::{
    resolve, ArgError, Args, DependencyCache, Param, Primitive, Provider, ProviderGraph, ResolveContext,
};
use super::serialize::{JsonSerializer, SerializationError, Serializer};
use crate::router::{Resolution, RouteError, Router, SUPPORTED_METHODS};
use crate::server::{Request, Response};

/// Handler signature: the request plus its resolved arguments
pub type HandlerFn = dyn Fn(&Request, &Args) -> Result<Reply, HandlerError> + Send + Sync;

/// One-shot initialization run before the server binds its listener
pub type StartupHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send + Sync>;

/// Error returned by a handler or provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Answered with `status` and `message` as-is
    Status {
        /// HTTP status code
        status: u16,
        /// Message for the `error` field of the body
        message: String,
    },
    /// Answered with a generic 500; the detail is only logged
    Internal(String),
}

impl HandlerError {
    /// An error answered with the given status
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        HandlerError::Status {
            status,
            message: message.into(),
        }
    }

    /// 404 with `message`
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// 400 with `message`
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// 500 whose detail stays in the logs
    pub fn internal(detail: impl Into<String>) -> Self {
        HandlerError::Internal(detail.into())
    }

    /// The error response for this failure
    #[must_use]
    pub fn to_response(&self) -> Response {
        match self {
            HandlerError::Status { status, message } => Response::error(*status, "HANDLER_ERROR", message),
            HandlerError::Internal(_) => internal_error(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Status { status, message } => write!(f, "{status}: {message}"),
            HandlerError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ArgError> for HandlerError {
    fn from(err: ArgError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

/// What a handler returns
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Serialized by the application's serializer
    Json(u16, Value),
    /// Sent as `text/plain; charset=utf-8`
    Text(u16, String),
    /// No body
    Empty(u16),
    /// Sent unchanged
    Response(Response),
}

impl Reply {
    /// 200 with a JSON body
    #[must_use]
    pub fn json(value: Value) -> Self {
        Reply::Json(200, value)
    }

    /// 200 with a text body
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(200, text.into())
    }

    /// 204 without a body
    #[must_use]
    pub fn empty() -> Self {
        Reply::Empty(204)
    }

    /// Override the status code
    #[must_use]
    pub fn with_status(self, status: u16) -> Self {
        match self {
            Reply::Json(_, v) => Reply::Json(status, v),
            Reply::Text(_, t) => Reply::Text(status, t),
            Reply::Empty(_) => Reply::Empty(status),
            Reply::Response(mut r) => {
                r.status = status;
                Reply::Response(r)
            }
        }
    }

    fn into_response(self, serializer: &dyn Serializer) -> Result<Response, SerializationError> {
        Ok(match self {
            Reply::Json(status, value) => {
                let out = serializer.serialize(&value)?;
                Response::with_body(status, &out.content_type, out.bytes)
            }
            Reply::Text(status, text) => Response::with_body(status, "text/plain; charset=utf-8", text.into_bytes()),
            Reply::Empty(status) => Response::new(status),
            Reply::Response(resp) => resp,
        })
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::json(value)
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(200, text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::text(text)
    }
}

impl From<()> for Reply {
    fn from((): ()) -> Self {
        Reply::empty()
    }
}

impl From<Response> for Reply {
    fn from(resp: Response) -> Self {
        Reply::Response(resp)
    }
}

/// Application configuration rejected by [`App::build`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A route could not be registered
    Route(RouteError),
    /// Two providers share a name
    DuplicateProvider(String),
    /// A route or provider depends on a provider that does not exist
    UnknownProvider {
        /// Missing provider name
        provider: String,
        /// Route or provider that references it
        required_by: String,
    },
    /// Providers depend on each other in a loop; the first name is repeated at the end
    DependencyCycle(Vec<String>),
    /// A path parameter is declared that the route template does not contain
    UnknownPathParameter {
        /// The route
        route: String,
        /// The parameter
        name: String,
    },
    /// A query default does not convert to its declared kind
    InvalidDefault {
        /// Parameter name
        name: String,
        /// Declared kind
        kind: Primitive,
        /// The default as given
        value: String,
    },
    /// The same argument name is declared twice for one route or provider
    DuplicateParameter {
        /// Route or provider
        owner: String,
        /// Repeated name
        name: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Route(err) => fmt::Display::fmt(err, f),
            ConfigError::DuplicateProvider(name) => write!(f, "provider '{name}' is registered more than once"),
            ConfigError::UnknownProvider { provider, required_by } => {
                write!(f, "{required_by} depends on unknown provider '{provider}'")
            }
            ConfigError::DependencyCycle(cycle) => {
                write!(f, "provider dependency cycle: {}", cycle.join(" -> "))
            }
            ConfigError::UnknownPathParameter { route, name } => {
                write!(f, "{route} declares path parameter '{name}' missing from its template")
            }
            ConfigError::InvalidDefault { name, kind, value } => {
                write!(f, "default '{value}' of query parameter '{name}' is not a valid {kind}")
            }
            ConfigError::DuplicateParameter { owner, name } => {
                write!(f, "{owner} declares argument '{name}' more than once")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<RouteError> for ConfigError {
    fn from(err: RouteError) -> Self {
        ConfigError::Route(err)
    }
}

/// A registered route: what to resolve and what to call
pub struct Endpoint {
    template: Arc<str>,
    params: Vec<Param>,
    handler: Box<HandlerFn>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("template", &self.template)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Route template this endpoint was registered under
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Declared handler parameters
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }
}

/// Builder for a [`Service`]
///
/// ```
/// use brrtserve::{App, Param, Primitive, Reply};
/// use serde_json::json;
///
/// let service = App::new()
///     .get("/items/{item_id}", vec![Param::path("item_id", Primitive::Int)], |_req, args| {
///         Ok(Reply::json(json!({ "id": args.get::<i64>(0)? })))
///     })
///     .build()
///     .unwrap();
/// assert_eq!(service.router().len(), 1);
/// ```
pub struct App {
    routes: Vec<(Method, String, Endpoint)>,
    providers: Vec<Provider>,
    startup: Vec<(String, StartupHook)>,
    decoder: Arc<dyn BodyDecoder>,
    serializer: Arc<dyn Serializer>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! method_shorthands {
    ($($fn_name:ident => $method:ident),* $(,)?) => {
        $(
            #[doc = concat!("Register a `", stringify!($method), "` route")]
            #[must_use]
            pub fn $fn_name<F>(self, template: &str, params: Vec<Param>, handler: F) -> Self
            where
                F: Fn(&Request, &Args) -> Result<Reply, HandlerError> + Send + Sync + 'static,
            {
                self.route(Method::$method, template, params, handler)
            }
        )*
    };
}

impl App {
    /// An application with the JSON decoder and serializer
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            providers: Vec::new(),
            startup: Vec::new(),
            decoder: Arc::new(JsonBodyDecoder),
            serializer: Arc::new(JsonSerializer),
        }
    }

    /// Register `handler` for `method` and `template`
    ///
    /// Problems with the route are reported by [`App::build`].
    #[must_use]
    pub fn route<F>(mut self, method: Method, template: &str, params: Vec<Param>, handler: F) -> Self
    where
        F: Fn(&Request, &Args) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        self.routes.push((
            method,
            template.to_string(),
            Endpoint {
                template: Arc::from(template),
                params,
                handler: Box::new(handler),
            },
        ));
        self
    }

    method_shorthands! {
        get => GET,
        post => POST,
        put => PUT,
        patch => PATCH,
        delete => DELETE,
        head => HEAD,
        options => OPTIONS,
    }

    /// Register a dependency provider under `name`
    ///
    /// Its result is computed at most once per request and shared by every
    /// parameter that depends on it.
    #[must_use]
    pub fn provide<T, F>(mut self, name: &str, params: Vec<Param>, provider: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Request, &Args) -> Result<T, HandlerError> + Send + Sync + 'static,
    {
        self.providers.push(Provider {
            name: Arc::from(name),
            params,
            func: Box::new(move |req, args| provider(req, args).map(|v| Arc::new(v) as Arg)),
        });
        self
    }

    /// Register a hook run once, in registration order, when the server starts
    ///
    /// Hooks run before the listener is bound, so no request is served until
    /// all of them have returned. A failing hook aborts the start.
    #[must_use]
    pub fn on_startup<F>(mut self, name: &str, hook: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.startup.push((name.to_string(), Box::new(hook)));
        self
    }

    /// Replace the body decoder
    #[must_use]
    pub fn body_decoder(mut self, decoder: impl BodyDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Replace the response serializer
    #[must_use]
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Validate everything and freeze it into a [`Service`]
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: invalid or duplicate routes,
    /// duplicate, unknown or cyclic providers, path parameters missing from a
    /// template, invalid query defaults.
    pub fn build(self) -> Result<Service, ConfigError> {
        for provider in &self.providers {
            check_params(&provider.params, &format!("provider '{}'", provider.name))?;
        }
        let providers = ProviderGraph::build(self.providers)?;
        info!(providers = providers.len(), "Provider graph validated");

        let mut router = Router::new();
        for (method, template, endpoint) in self.routes {
            let owner = format!("route {method} {template}");
            check_params(&endpoint.params, &owner)?;
            providers.check_references(&endpoint.params, &owner)?;

            let mut needed = Vec::new();
            providers.path_params_needed(&endpoint.params, &mut needed);
            if let Some(missing) = needed
                .iter()
                .find(|name| !template.contains(&format!("{{{name}}}")))
            {
                return Err(ConfigError::UnknownPathParameter {
                    route: owner,
                    name: (*missing).to_string(),
                });
            }

            router.register(method, &template, Arc::new(endpoint))?;
        }
        info!(routes = router.len(), "Route table built");

        Ok(Service {
            router,
            providers,
            startup: self.startup,
            decoder: self.decoder,
            serializer: self.serializer,
        })
    }
}

fn check_params(params: &[Param], owner: &str) -> Result<(), ConfigError> {
    for (i, param) in params.iter().enumerate() {
        if params[..i].iter().any(|p| p.name() == param.name()) {
            return Err(ConfigError::DuplicateParameter {
                owner: owner.to_string(),
                name: param.name().to_string(),
            });
        }
        if let Param::Query {
            name,
            kind,
            default: Some(value),
        } = param
        {
            if kind.convert(value).is_none() {
                return Err(ConfigError::InvalidDefault {
                    name: name.to_string(),
                    kind: *kind,
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

fn internal_error() -> Response {
    Response::error(500, "INTERNAL_ERROR", "Internal Server Error")
}

/// The immutable application: route table, provider graph and collaborators.
///
/// Shared read-only between worker threads.
pub struct Service {
    router: Router<Arc<Endpoint>>,
    providers: ProviderGraph,
    startup: Vec<(String, StartupHook)>,
    decoder: Arc<dyn BodyDecoder>,
    serializer: Arc<dyn Serializer>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("routes", &self.router.len())
            .field("providers", &self.providers)
            .field("startup_hooks", &self.startup.len())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// The route table
    #[must_use]
    pub fn router(&self) -> &Router<Arc<Endpoint>> {
        &self.router
    }

    /// The provider graph
    #[must_use]
    pub fn providers(&self) -> &ProviderGraph {
        &self.providers
    }

    /// Run the registered startup hooks, each at most once.
    ///
    /// Hooks are consumed as they run, so a second call does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure; hooks after it are not run.
    pub fn run_startup_hooks(&mut self) -> anyhow::Result<()> {
        for (name, hook) in std::mem::take(&mut self.startup) {
            info!(hook = %name, "Running startup hook");
            let start = Instant::now();
            if let Err(err) = hook() {
                error!(hook = %name, error = %format!("{err:#}"), "Startup hook failed");
                return Err(err.context(format!("startup hook '{name}' failed")));
            }
            debug!(hook = %name, duration_ms = start.elapsed().as_millis() as u64, "Startup hook finished");
        }
        Ok(())
    }

    /// Handle one request.
    ///
    /// Every failure becomes an error response: 404 and 405 from routing, 400
    /// from argument resolution, the handler's own status for a
    /// [`HandlerError`], and 500 for panics and serialization failures.
    pub fn handle(&self, req: &Request) -> Response {
        let (endpoint, path_params) = match self.route(req) {
            Ok(found) => found,
            Err(resp) => return resp,
        };

        let ctx = ResolveContext {
            providers: &self.providers,
            decoder: self.decoder.as_ref(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut cache = DependencyCache::new();
            let args = match resolve(&endpoint.params, req, &path_params, ctx, &mut cache) {
                Ok(args) => args,
                Err(err) => {
                    debug!(template = %endpoint.template, error = %err, "Argument resolution failed");
                    return err.to_response();
                }
            };

            let start = Instant::now();
            let result = (endpoint.handler)(req, &args);
            debug!(
                template = %endpoint.template,
                providers_evaluated = cache.len(),
                handler_us = start.elapsed().as_micros() as u64,
                "Handler finished"
            );

            match result {
                Ok(reply) => reply.into_response(self.serializer.as_ref()).unwrap_or_else(|err| {
                    error!(template = %endpoint.template, error = %err, "Response serialization failed");
                    internal_error()
                }),
                Err(HandlerError::Internal(detail)) => {
                    error!(template = %endpoint.template, detail = %detail, "Handler failed");
                    internal_error()
                }
                Err(err) => err.to_response(),
            }
        }));

        let response = outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                method = %req.method,
                path = %req.path,
                template = %endpoint.template,
                panic_message = %message,
                "Handler panicked"
            );
            internal_error()
        });

        if (100..=599).contains(&response.status) {
            response
        } else {
            error!(
                template = %endpoint.template,
                status = response.status,
                "Handler produced a status outside 100-599"
            );
            internal_error()
        }
    }

    fn route(&self, req: &Request) -> Result<(Arc<Endpoint>, crate::router::ParamVec), Response> {
        let mut resolution = self.router.resolve(&req.method, &req.path);
        if req.method == Method::HEAD && !matches!(resolution, Resolution::Matched(_)) {
            if let Resolution::Matched(m) = self.router.resolve(&Method::GET, &req.path) {
                resolution = Resolution::Matched(m);
            }
        }

        match resolution {
            Resolution::Matched(m) => Ok((Arc::clone(m.handler), m.path_params)),
            Resolution::MethodNotAllowed { mut allowed } => {
                if allowed.contains(&Method::GET) && !allowed.contains(&Method::HEAD) {
                    allowed.push(Method::HEAD);
                    allowed.sort_by_key(|m| SUPPORTED_METHODS.iter().position(|s| s == m));
                }
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                warn!(method = %req.method, path = %req.path, allow = %allow, "Method not allowed");
                let mut resp = Response::error(405, "METHOD_NOT_ALLOWED", "Method Not Allowed");
                resp.set_header("allow", allow);
                Err(resp)
            }
            Resolution::NotFound => {
                debug!(method = %req.method, path = %req.path, "Route not found");
                Err(Response::error(404, "NOT_FOUND", "Not Found"))
            }
        }
    }
}

//! # Dispatcher Module
//!
//! The dispatcher turns a parsed [`Request`](crate::server::Request) into a
//! [`Response`](crate::server::Response). It owns the immutable application
//! assembled at startup: the route table, the provider graph, the body decoder
//! and the response serializer.
//!
//! ## Request Flow
//!
//! 1. The router resolves method and path to an [`Endpoint`] and its path parameters
//! 2. The resolver assembles the handler's [`Args`] in declaration order,
//!    running each provider at most once per request
//! 3. The handler runs and returns a [`Reply`] or a [`HandlerError`]
//! 4. The reply is serialized into a response
//!
//! ## Error Handling
//!
//! Nothing that happens inside a request escapes [`Service::handle`]:
//! - Unknown paths return 404, known paths under other methods 405 with `Allow`
//! - Type mismatches, missing parameters and invalid bodies return 400
//! - A [`HandlerError`] returns its own status
//! - Panics are caught and return 500
//!
//! ## Providers
//!
//! Providers are registered independently of routes with [`App::provide`] and
//! may depend on other providers. The graph is checked for unknown names and
//! cycles by [`App::build`], so resolution never fails for configuration
//! reasons at request time.

mod core;
pub mod decode;
pub mod resolver;
pub mod serialize;

pub use self::core::{App, ConfigError, Endpoint, HandlerError, HandlerFn, Reply, Service, StartupHook};
pub use decode::{Arg, BodyDecoder, BodyType, FieldError, JsonBodyDecoder, ValidationError};
pub use resolver::{
    resolve, ArgError, Args, DependencyCache, Location, Param, Primitive, ProviderGraph, ResolutionError,
    ResolveContext,
};
pub use serialize::{JsonSerializer, SerializationError, Serialized, Serializer};

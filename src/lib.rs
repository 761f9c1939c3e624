//! # brrtserve
//!
//! **brrtserve** is a minimal, thread-per-connection HTTP/1.1 server with a radix
//! router and request-scoped dependency injection.
//!
//! ## Overview
//!
//! Routes and dependency providers are registered with explicit calls at startup
//! and frozen into an immutable [`Service`]. An acceptor thread hands accepted
//! connections to a fixed pool of OS worker threads through a bounded queue;
//! each worker serves one connection at a time, with keep-alive and pipelining.
//!
//! ## Architecture
//!
//! - **[`server`]** - Wire codec, connection loop and the [`HttpServer`] acceptor
//! - **[`router`]** - Radix tree per method with literal-first precedence
//! - **[`dispatcher`]** - [`App`] builder, argument resolution, provider graph
//!   and the per-request dependency cache
//! - **[`worker_pool`]** - OS threads draining a bounded `crossbeam` channel
//! - **[`config`]** - [`ServerConfig`] from defaults, YAML and `BRRTR_*` variables
//! - **[`logging`]** - `tracing-subscriber` setup
//! - **[`demo`]** - Item API served by the `brrtserve` binary
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Acceptor as Acceptor thread
//!     participant Queue as Bounded queue
//!     participant Worker as Worker thread<br/>(connection loop)
//!     participant Codec as Wire codec
//!     participant Router as Router
//!     participant Resolver as Resolver<br/>(dependency cache)
//!     participant Handler as Handler
//!
//!     Client->>Acceptor: TCP connect
//!     Acceptor->>Queue: try_send(stream)
//!     alt Queue full
//!         Acceptor-->>Client: 503 Service Unavailable, close
//!     end
//!     Queue->>Worker: stream
//!     loop Until close
//!         Client->>Worker: Request bytes
//!         Worker->>Codec: parse(buffer)
//!         alt Malformed
//!             Worker-->>Client: 400, close
//!         end
//!         Worker->>Router: resolve(method, path)
//!         alt No route
//!             Worker-->>Client: 404 / 405 + Allow
//!         end
//!         Worker->>Resolver: resolve params, run providers once
//!         Resolver->>Handler: Args
//!         Handler-->>Worker: Reply or HandlerError
//!         Worker->>Codec: write(response)
//!         Worker-->>Client: Response (keep-alive or close)
//!     end
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use brrtserve::{App, HttpServer, Param, Primitive, Reply, ServerConfig};
//! use serde_json::json;
//!
//! let service = App::new()
//!     .on_startup("announce", || {
//!         println!("starting");
//!         Ok(())
//!     })
//!     .provide("greeting", vec![], |_req, _args| Ok("hello".to_string()))
//!     .get(
//!         "/hello/{name}",
//!         vec![Param::path("name", Primitive::Str), Param::depends("greeting", "greeting")],
//!         |_req, args| {
//!             let name = args.get::<String>(0)?;
//!             let greeting = args.get::<String>(1)?;
//!             Ok(Reply::json(json!({ "message": format!("{greeting}, {name}") })))
//!         },
//!     )
//!     .build()?;
//!
//! let handle = HttpServer::new(service, ServerConfig::load(None)?).start()?;
//! handle.join().ok();
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Runtime Considerations
//!
//! - A worker is occupied for the whole lifetime of its connection; size
//!   `workers` for the number of concurrent connections, not requests
//! - There is no per-request timeout: a handler that never returns holds its worker
//! - Handler panics are caught and answered with 500; the worker survives

pub mod cli;
pub mod config;
pub mod demo;
pub mod dispatcher;
pub mod ids;
pub mod logging;
pub mod router;
pub mod server;
pub mod worker_pool;

pub use config::ServerConfig;
pub use dispatcher::{App, Args, BodyType, ConfigError, HandlerError, Param, Primitive, Reply, Service};
pub use ids::RequestId;
pub use server::{HttpServer, Request, Response, ServerHandle};

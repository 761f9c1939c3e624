//! # Server Module
//!
//! Blocking HTTP/1.1 over plain TCP.
//!
//! - [`codec`] parses request bytes and writes response bytes
//! - [`request`] and [`response`] hold the parsed and outgoing messages
//! - [`HttpServer`] binds the listener, runs the acceptor and hands each
//!   connection to a worker thread, which serves it until it closes
//!
//! A full connection queue is answered with a canned 503 and the socket is
//! dropped.

pub mod codec;
mod connection;
pub mod http_server;
pub mod request;
pub mod response;

pub use codec::{ParseLimits, Parsed, ProtocolError};
pub use http_server::{HttpServer, ServerHandle};
pub use request::Request;
pub use response::{HeaderVec, Response};

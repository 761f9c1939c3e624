//! # CLI Module
//!
//! Command-line interface of the `brrtserve` binary.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Run the demo item API:
//!
//! ```bash
//! brrtserve serve --config server.yaml --port 8080 --workers 16
//! ```
//!
//! Options:
//! - `--config <FILE>` - YAML server configuration
//! - `--host <HOST>` - Interface to bind (overrides config and `BRRTR_HOST`)
//! - `--port <PORT>` - Port to bind (overrides config and `BRRTR_PORT`)
//! - `--workers <N>` - Worker threads (overrides config and `BRRTR_WORKERS`)
//!
//! The server stops gracefully on SIGINT or SIGTERM.
//!
//! ### `routes`
//!
//! Print the route table of the demo API:
//!
//! ```bash
//! brrtserve routes
//! ```
//!
//! ## Usage from Code
//!
//! ```rust,ignore
//! use brrtserve::cli::{run_cli, Cli};
//! use clap::Parser;
//!
//! run_cli(Cli::parse())?;
//! ```

mod commands;


pub use commands::{run_cli, Cli, Commands, ServeArgs};

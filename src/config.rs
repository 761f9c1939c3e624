//! # Server Configuration
//!
//! [`ServerConfig`] is assembled in layers, each overriding the previous one:
//!
//! 1. Built-in defaults
//! 2. An optional YAML file
//! 3. `BRRTR_*` environment variables
//! 4. Command-line flags (applied by the CLI)
//!
//! ## Environment Variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `BRRTR_HOST` | `host` | `127.0.0.1` |
//! | `BRRTR_PORT` | `port` | `8000` |
//! | `BRRTR_WORKERS` | `workers` | available parallelism, or 4 |
//! | `BRRTR_BACKLOG` | `backlog` | `1024` |
//! | `BRRTR_IDLE_TIMEOUT_MS` | `idle_timeout_ms` | `30000` |
//! | `BRRTR_WRITE_TIMEOUT_MS` | `write_timeout_ms` | `10000` |
//! | `BRRTR_MAX_HEADER_BYTES` | `max_header_bytes` | `8192` |
//! | `BRRTR_MAX_BODY_BYTES` | `max_body_bytes` | `1048576` |
//! | `BRRTR_MAX_REQUESTS_PER_CONNECTION` | `max_requests_per_connection` | `1000` |
//!
//! ## Example file
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 8080
//! workers: 16
//! idle_timeout_ms: 5000
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::server::codec::ParseLimits;

/// Process configuration for the HTTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind; 0 picks a free port
    pub port: u16,
    /// Number of worker threads, each serving one connection at a time
    pub workers: usize,
    /// Accepted connections that may wait for a worker before new ones get a 503
    pub backlog: usize,
    /// Close a connection that sends nothing for this long
    pub idle_timeout_ms: u64,
    /// Give up on a response write after this long
    pub write_timeout_ms: u64,
    /// Largest accepted start-line plus headers
    pub max_header_bytes: usize,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Close a keep-alive connection after this many requests
    pub max_requests_per_connection: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = ParseLimits::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            backlog: 1024,
            idle_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            max_header_bytes: limits.max_header_bytes,
            max_body_bytes: limits.max_body_bytes,
            max_requests_per_connection: 1000,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value '{raw}' for {key}"))
}

impl ServerConfig {
    /// Defaults, then `path` if given, then the environment.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed, when an environment
    /// variable does not parse, or when the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file; fields it omits keep their defaults
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or contains unknown or mistyped fields.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Override fields from `BRRTR_*` variables provided by `lookup`
    ///
    /// # Errors
    ///
    /// Fails on the first variable that does not parse.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("BRRTR_HOST") {
            self.host = v.trim().to_string();
        }
        if let Some(v) = lookup("BRRTR_PORT") {
            self.port = parse_var("BRRTR_PORT", &v)?;
        }
        if let Some(v) = lookup("BRRTR_WORKERS") {
            self.workers = parse_var("BRRTR_WORKERS", &v)?;
        }
        if let Some(v) = lookup("BRRTR_BACKLOG") {
            self.backlog = parse_var("BRRTR_BACKLOG", &v)?;
        }
        if let Some(v) = lookup("BRRTR_IDLE_TIMEOUT_MS") {
            self.idle_timeout_ms = parse_var("BRRTR_IDLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BRRTR_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = parse_var("BRRTR_WRITE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BRRTR_MAX_HEADER_BYTES") {
            self.max_header_bytes = parse_var("BRRTR_MAX_HEADER_BYTES", &v)?;
        }
        if let Some(v) = lookup("BRRTR_MAX_BODY_BYTES") {
            self.max_body_bytes = parse_var("BRRTR_MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = lookup("BRRTR_MAX_REQUESTS_PER_CONNECTION") {
            self.max_requests_per_connection = parse_var("BRRTR_MAX_REQUESTS_PER_CONNECTION", &v)?;
        }
        Ok(())
    }

    /// Reject values the server cannot run with
    ///
    /// # Errors
    ///
    /// Names the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        for (name, value) in [
            ("workers", self.workers),
            ("backlog", self.backlog),
            ("max_header_bytes", self.max_header_bytes),
            ("max_requests_per_connection", self.max_requests_per_connection),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.idle_timeout_ms == 0 || self.write_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        Ok(())
    }

    /// `host:port`, with IPv6 literals in brackets
    #[must_use]
    pub fn addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Parser limits derived from this configuration
    #[must_use]
    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

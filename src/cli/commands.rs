use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::config::ServerConfig;
use crate::demo;
use crate::server::{HttpServer, ServerHandle};

/// Command-line interface for brrtserve
#[derive(Parser)]
#[command(name = "brrtserve")]
#[command(about = "Minimal HTTP/1.1 server with a radix router", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the demo item API
    Serve(ServeArgs),
    /// Print the route table of the demo item API
    Routes,
}

/// Options of `serve`; flags override the config file and `BRRTR_*` variables
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct ServeArgs {
    /// Path to a YAML server configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl ServeArgs {
    /// Layer the flags over `config`
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }

    /// Defaults, file, environment, then flags
    ///
    /// # Errors
    ///
    /// Fails when the file or environment is invalid, or the flags make the
    /// configuration invalid.
    pub fn load_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Run the CLI with the provided arguments
///
/// # Errors
///
/// Returns an error if configuration is invalid, the demo service cannot be
/// built or the server cannot start.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            let config = args.load_config()?;
            let service = demo::service().context("Failed to build demo service")?;
            let handle = HttpServer::new(service, config)
                .start()
                .context("Failed to start server")?;
            wait_for_shutdown(handle)
        }
        Commands::Routes => {
            let service = demo::service().context("Failed to build demo service")?;
            service.router().dump_routes();
            Ok(())
        }
    }
}

#[cfg(unix)]
fn wait_for_shutdown(handle: ServerHandle) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    if let Some(signal) = signals.forever().next() {
        info!(signal = signal, "Shutdown signal received");
    }
    handle.stop();
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_shutdown(handle: ServerHandle) -> Result<()> {
    handle
        .join()
        .map_err(|e| anyhow::anyhow!("server thread panicked: {e:?}"))
}

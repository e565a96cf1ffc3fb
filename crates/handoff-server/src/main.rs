//! handoff-server: an HTTP server that restarts without dropping connections.
//!
//! Send `SIGHUP` to replace the running process with a fresh instance of the
//! same executable; `SIGTERM` or `SIGINT` to drain and exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use handoff::config::CONFIG_ENV;
use handoff::{Config, Error, ExecSpawner, Server};
use tracing::{info, info_span, warn, Instrument};

mod routes;
mod telemetry;

use telemetry::LogFormat;

/// Zero-downtime HTTP server
#[derive(Debug, Parser)]
#[command(name = "handoff-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (environment variables still take precedence)
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// TCP address to listen on
    #[arg(short, long)]
    addr: Option<String>,

    /// Path of the unix control socket used during succession
    #[arg(short, long)]
    sock_file: Option<PathBuf>,

    /// Seconds to wait for in-flight connections when shutting down
    #[arg(short = 't', long)]
    shutdown_timeout_secs: Option<u64>,

    /// Capacity of the signal queue
    #[arg(long)]
    signal_buffer_size: Option<usize>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::from_env().context("Failed to load config from environment")?,
        };

        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if let Some(sock_file) = &self.sock_file {
            config.sock_file = sock_file.clone();
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = self.signal_buffer_size {
            config.signal_buffer_size = size;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format).context("Failed to initialize telemetry")?;

    let span = info_span!("server", pid = std::process::id());
    run(cli).instrument(span).await
}

async fn run(cli: Cli) -> Result<()> {
    info!("Handoff server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = cli.load_config()?;
    config.log_config();

    let mut server = Server::bind(config)
        .await
        .context("Failed to acquire listening socket")?;

    // The replacement re-reads the same file; the effective settings still
    // travel as HANDOFF_* variables and take precedence over it.
    if let Some(path) = &cli.config {
        let spawner = ExecSpawner::for_config(server.config())
            .context("Failed to locate current executable")?
            .env(CONFIG_ENV, path);
        server = server.with_spawner(spawner);
    }

    info!(
        addr = %server.local_addr().context("Listening socket has no local address")?,
        name = server.listener_name(),
        "Listening"
    );

    match server.run(routes::router()).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Handoff server stopped");
            Ok(())
        }
        Err(Error::Shutdown(e)) => {
            warn!(error = %e, "Shutdown did not complete cleanly");
            Ok(())
        }
        Err(e) => Err(e).context("Server failed"),
    }
}

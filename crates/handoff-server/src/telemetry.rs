//! Log output for the server process.
//!
//! Both the process handing off and its replacement write to the same
//! inherited stdout/stderr. `main` runs everything inside a span carrying
//! the PID so the two can be told apart.

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,handoff=debug,handoff_server=debug";

/// Output format of the console logger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install the global subscriber.
///
/// Environment variables:
/// - `RUST_LOG`: log filter (default: `info,handoff=debug,handoff_server=debug`)
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true),
            )
            .try_init()?,
    }

    tracing::info!(pid = std::process::id(), format = ?format, "Telemetry initialized");
    Ok(())
}

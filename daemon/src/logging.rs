//! Tracing subscriber setup for the daemon.

use anyhow::{Context, Result};
use docqueue::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Installs the global subscriber and routes `log` records into it.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docqueue={0},docqueued={0}", config.level)));

    let installed = match config.format {
        LogFormat::Pretty => {
            let subscriber = Registry::default()
                .with(filter)
                .with(fmt::layer().with_target(false).with_thread_names(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Json => {
            let subscriber = Registry::default()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.context("Failed to install tracing subscriber")
}

//! Tracing subscriber installation for the `ptyd` binary
//!
//! Library code only emits events; the binary decides where they go.

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Build the filter from the configured directive string
///
/// An unparsable directive falls back to the default rather than silencing
/// the daemon.
pub fn filter_from(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives)
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER))
}

/// Install the global subscriber: stderr, or the configured log file
pub fn init(config: &ServerConfig) -> Result<()> {
    let filter = filter_from(&config.log_filter);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .with(filter)
                .try_init()
                .context("logging already initialized")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .context("logging already initialized")?;
        }
    }

    Ok(())
}

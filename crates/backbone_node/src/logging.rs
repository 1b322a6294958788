//! Logging system setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// # Arguments
/// * `level` - Fallback filter when `RUST_LOG` is unset, e.g. "info"
/// * `json_format` - Emit one JSON object per event instead of text lines
pub fn setup_logging(level: &str, json_format: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json_format {
        registry
            .with(fmt::layer().json().with_target(false).with_thread_names(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_names(true))
            .try_init()
    };

    installed.map_err(|e| anyhow!("failed to install logger: {e}"))
}

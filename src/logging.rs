//! Log output setup.
//!
//! Components never touch global logger state; they emit `tracing` events
//! inside spans they construct and own. This module only installs the
//! subscriber that renders those events, once per process.

use std::env;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::errors::{PubSubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines on stderr, `info` and above.
    Production,
    /// Human-readable multi-line output on stderr, `debug` and above.
    Development,
}

impl LogFormat {
    /// Picks the format from `LOG_CONFIG`: `production` selects
    /// [`LogFormat::Production`], anything else [`LogFormat::Development`].
    pub fn from_env() -> Self {
        Self::parse(env::var("LOG_CONFIG").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("production") => LogFormat::Production,
            _ => LogFormat::Development,
        }
    }

    fn default_directive(self) -> &'static str {
        match self {
            LogFormat::Production => "info",
            LogFormat::Development => "debug",
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the format's default level. Fails if a subscriber is
/// already installed.
pub fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format.default_directive()))
        .map_err(|err| PubSubError::Config(format!("invalid log filter: {err}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Production => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Development => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|err| PubSubError::Config(format!("failed to initialize logging: {err}")))?;

    tracing::debug!(format = ?format, "logging_initialized");
    Ok(())
}

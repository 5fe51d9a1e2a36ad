//! Structured logging setup
//!
//! The subscriber is installed once by the binary. Components log through the
//! `tracing` macros and never hold a logger handle of their own.
//!
//! # Examples
//!
//! ```rust,no_run
//! use neuronip_api::observability::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default()).expect("Failed to initialize logging");
//! ```

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production (machine-readable)
    Json,
    /// Pretty format for development (human-readable)
    Pretty,
    /// Compact format for minimal output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Main logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log format
    pub format: LogFormat,
    /// Default log level, used when `RUST_LOG` is unset
    pub level: String,
    /// Per-module directives (e.g., "neuronip_api=debug,tower_http=warn").
    /// Takes precedence over both `RUST_LOG` and `level`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            filter: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the event filter for `config`
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    match config.filter {
        Some(ref filter) => Ok(EnvFilter::try_new(filter)?),
        None => Ok(EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))?),
    }
}

/// Initialize the logging system with the given configuration
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = build_filter(config)?;

    match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(json_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(pretty_layer).try_init()?;
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer().compact().with_filter(env_filter);

            tracing_subscriber::registry().with(compact_layer).try_init()?;
        }
    }

    info!("Logging system initialized with format: {:?}", config.format);
    Ok(())
}

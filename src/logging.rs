//! Logging and tracing setup.
//!
//! The subscriber is installed exactly once, at process start. Components do
//! not reach for global logger state: they receive a [`Span`] from the
//! [`Logger`] handle through their constructors and record under it.

use clap::{ArgAction, Args, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{info, info_span, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConfigError;

// ============================================================================
// LOGGING CONFIGURATION
// ============================================================================

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct LoggingConfig {
    /// Default level; `RUST_LOG` directives take precedence
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, compact, pretty)
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Enable ANSI colors
    #[arg(long = "log-colors", env = "LOG_COLORS", default_value_t = true, action = ArgAction::Set)]
    #[serde(default = "default_true")]
    pub colors: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format(), colors: true }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.level
            .parse::<LevelFilter>()
            .map_err(|_| ConfigError::invalid_value("log-level", format!("unknown level '{}'", self.level)))
    }
}

// ============================================================================
// LOGGER HANDLE
// ============================================================================

/// Root span of a process, handed to components at construction.
#[derive(Debug, Clone)]
pub struct Logger {
    root: Span,
}

impl Logger {
    pub fn new(process: &'static str) -> Self {
        Self { root: info_span!(target: "relay", "relay", process) }
    }

    /// Logger that records nothing; for tests and embedding.
    pub fn disabled() -> Self {
        Self { root: Span::none() }
    }

    /// Span for one component, nested under the process span
    pub fn component(&self, name: &'static str) -> Span {
        info_span!(target: "relay", parent: &self.root, "component", name)
    }
}

// ============================================================================
// SUBSCRIBER INITIALIZATION
// ============================================================================

/// Install the global subscriber and return the process logger.
pub fn init_logging(config: &LoggingConfig, process: &'static str) -> Result<Logger, ConfigError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level_filter()?.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.colors).with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.colors).with_target(true))
            .try_init(),
    };
    installed.map_err(|e| ConfigError::Logging { message: e.to_string() })?;

    info!(
        target: "relay::init",
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );

    Ok(Logger::new(process))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        let mut config = LoggingConfig::default();
        assert_eq!(config.level_filter().unwrap(), LevelFilter::INFO);

        config.level = "debug".into();
        assert_eq!(config.level_filter().unwrap(), LevelFilter::DEBUG);

        config.level = "loud".into();
        assert!(config.level_filter().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.colors);

        let config: LoggingConfig = serde_json::from_str(r#"{"format":"json","colors":false}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.colors);
    }
}

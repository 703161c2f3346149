//! Command-line and environment configuration for both processes.
//!
//! Every setting can come from a flag or an environment variable; a flag
//! wins over the environment, which wins over the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::signing::Signer;
use crate::storage::StorageConfig;
use crate::DEFAULT_ADDRESS;

// ============================================================================
// AGENT CONFIGURATION
// ============================================================================

/// Metrics agent: samples runtime statistics and reports them to the server
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-agent", author = "AIOps Team", version)]
pub struct AgentConfig {
    /// Server address (host:port, scheme optional)
    #[arg(short = 'a', long, env = "ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Seconds between samples
    #[arg(short = 'p', long = "poll-interval", env = "POLL_INTERVAL", default_value_t = 2)]
    pub poll_interval: u64,

    /// Seconds between reports
    #[arg(short = 'r', long = "report-interval", env = "REPORT_INTERVAL", default_value_t = 10)]
    pub report_interval: u64,

    /// HMAC secret; empty disables signing
    #[arg(short = 'k', long, env = "KEY", default_value = "", hide_env_values = true)]
    pub key: String,

    /// Maximum concurrent outgoing requests
    #[arg(short = 'l', long = "rate-limit", env = "RATE_LIMIT", default_value_t = 1)]
    pub rate_limit: usize,

    /// Send each metric to /update/{type}/{name}/{value} instead of batching
    #[arg(
        long = "legacy-path",
        env = "LEGACY_PATH",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub legacy_path: bool,

    /// Per-request timeout in seconds
    #[arg(long = "http-timeout", env = "HTTP_TIMEOUT", default_value_t = 10)]
    pub http_timeout: u64,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        if self.poll_interval == 0 {
            return Err(ConfigError::invalid_value("poll_interval", "must be at least 1 second"));
        }
        if self.report_interval == 0 {
            return Err(ConfigError::invalid_value("report_interval", "must be at least 1 second"));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::invalid_value("rate_limit", "must be at least 1"));
        }
        if self.http_timeout == 0 {
            return Err(ConfigError::invalid_value("http_timeout", "must be at least 1 second"));
        }
        self.logging.level_filter()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    pub fn signer(&self) -> Option<Signer> {
        Signer::from_key(&self.key)
    }
}

// ============================================================================
// SERVER CONFIGURATION
// ============================================================================

/// Metrics server: accepts updates and persists them
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-server", author = "AIOps Team", version)]
pub struct ServerConfig {
    /// Listen address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Seconds between snapshots; 0 snapshots after every update
    #[arg(short = 'i', long = "store-interval", env = "STORE_INTERVAL", default_value_t = 300)]
    pub store_interval: u64,

    /// Metrics file; empty keeps metrics in memory only
    #[arg(short = 'f', long = "file-storage-path", env = "FILE_STORAGE_PATH", default_value = "data/metrics.json")]
    pub file_storage_path: String,

    /// Load the snapshot file at startup
    #[arg(
        short = 'r',
        long,
        env = "RESTORE",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub restore: bool,

    /// PostgreSQL connection string; takes precedence over the file
    #[arg(short = 'd', long = "database-dsn", env = "DATABASE_DSN", default_value = "", hide_env_values = true)]
    pub database_dsn: String,

    /// HMAC secret; empty disables verification
    #[arg(short = 'k', long, env = "KEY", default_value = "", hide_env_values = true)]
    pub key: String,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        self.logging.level_filter()?;
        Ok(())
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            database_dsn: Some(self.database_dsn.clone()).filter(|dsn| !dsn.is_empty()),
            file_path: Some(PathBuf::from(&self.file_storage_path)).filter(|p| !p.as_os_str().is_empty()),
        }
    }

    pub fn signer(&self) -> Option<Signer> {
        Signer::from_key(&self.key)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.into(),
            store_interval: 300,
            file_storage_path: "data/metrics.json".into(),
            restore: true,
            database_dsn: String::new(),
            key: String::new(),
            logging: LoggingConfig::default(),
        }
    }
}

//! Error taxonomy for every subsystem.

use thiserror::Error;

use crate::model::MetricKind;

// ============================================================================
// VALIDATION ERRORS
// ============================================================================
// Raised at the request boundary, before any storage call. Never retried.
// ============================================================================

/// Errors found while checking an untrusted metric
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid id: must be non-empty and contain only letters and digits, got '{name}'")]
    InvalidName { name: String },

    #[error("invalid type: must be 'gauge' or 'counter', got '{kind}'")]
    InvalidKind { kind: String },

    #[error("invalid metric value: counter '{name}' requires delta")]
    MissingDelta { name: String },

    #[error("invalid metric value: gauge '{name}' requires value")]
    MissingValue { name: String },

    #[error("invalid 'counter' metric value: must be int64, got '{raw}'")]
    InvalidCounterValue { raw: String },

    #[error("invalid 'gauge' metric value: must be float64, got '{raw}'")]
    InvalidGaugeValue { raw: String },

    #[error("malformed request body: {message}")]
    MalformedBody { message: String },
}

impl ValidationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedBody { message: message.into() }
    }
}

// ============================================================================
// STORAGE ERRORS
// ============================================================================

/// Errors raised by storage backends and units of work
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("counter '{name}' overflowed while accumulating")]
    CounterOverflow { name: String },

    #[error("failed to acquire lock on {resource}: {message}")]
    Lock { resource: String, message: String },

    #[error("stored row is invalid: {message}")]
    Corrupt { message: String },
}

/// SQLSTATE class for connection exceptions
const PG_CONNECTION_EXCEPTION_CLASS: &str = "08";

impl StorageError {
    pub fn lock(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock { resource: resource.into(), message: message.into() }
    }

    /// Transient failures worth repeating the whole unit of work for
    pub fn is_retriable(&self) -> bool {
        match self {
            StorageError::Database(e) => is_retriable_sqlx(e),
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "io",
            StorageError::Serialization(_) => "serialization",
            StorageError::Database(_) => "database",
            StorageError::CounterOverflow { .. } => "overflow",
            StorageError::Lock { .. } => "lock",
            StorageError::Corrupt { .. } => "corrupt",
        }
    }
}

fn is_retriable_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with(PG_CONNECTION_EXCEPTION_CLASS))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// ENGINE ERRORS
// ============================================================================

/// Errors surfaced by the update engine to the HTTP layer
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("metric not found: {kind}/{name}")]
    NotFound { kind: MetricKind, name: String },

    #[error(transparent)]
    Persistence(#[from] StorageError),
}

impl EngineError {
    pub fn not_found(kind: MetricKind, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Persistence(e) => e.category(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Agent-side delivery failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to compress batch: {0}")]
    Compress(#[source] std::io::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded with status {status}")]
    Status { status: u16 },

    #[error("send cancelled")]
    Cancelled,
}

impl TransportError {
    /// Timeouts, connection failures and gateway statuses are transient
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Request(e) => e.is_timeout() || e.is_connect(),
            TransportError::Status { status } => matches!(status, 408 | 504),
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Encode(_) => "encode",
            TransportError::Compress(_) => "compress",
            TransportError::Request(_) => "request",
            TransportError::Status { .. } => "status",
            TransportError::Cancelled => "cancelled",
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

/// Errors related to configuration validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue { field: field.into(), message: message.into() }
    }
}

// ============================================================================
// SERVER ERRORS
// ============================================================================

/// Startup and shutdown failures of the server process
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("shutdown did not finish within {secs}s")]
    ShutdownTimeout { secs: u64 },
}

impl ServerError {
    pub fn category(&self) -> &'static str {
        match self {
            ServerError::Storage(e) => e.category(),
            ServerError::Engine(e) => e.category(),
            ServerError::Bind { .. } => "bind",
            ServerError::Serve(_) => "serve",
            ServerError::Task(_) => "task",
            ServerError::ShutdownTimeout { .. } => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_classification() {
        assert!(TransportError::Status { status: 408 }.is_retriable());
        assert!(TransportError::Status { status: 504 }.is_retriable());
        assert!(!TransportError::Status { status: 500 }.is_retriable());
        assert!(!TransportError::Status { status: 400 }.is_retriable());
        assert!(!TransportError::Cancelled.is_retriable());
    }

    #[test]
    fn test_storage_classification() {
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_retriable());
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_retriable());
        assert!(!StorageError::CounterOverflow { name: "x".into() }.is_retriable());
    }

    #[test]
    fn test_engine_error_categories() {
        let err: EngineError = ValidationError::InvalidKind { kind: "x".into() }.into();
        assert_eq!(err.category(), "validation");
        assert_eq!(EngineError::not_found(MetricKind::Gauge, "x").category(), "not_found");
    }
}

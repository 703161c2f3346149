//! Mapping of engine failures onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::{EngineError, ValidationError};

/// Handler-level error. Every variant renders as a plain-text body.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// `HashSHA256` header did not match the request body
    #[error("invalid signature")]
    InvalidSignature,
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Engine(EngineError::Validation(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Engine(EngineError::Validation(e)) => {
                debug!(target: "relay::server", error = %e, "Rejected metric");
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            AppError::Engine(e @ EngineError::NotFound { .. }) => (StatusCode::NOT_FOUND, e.to_string()),
            AppError::Engine(EngineError::Persistence(e)) => {
                error!(target: "relay::server", category = e.category(), error = %e, "Persistence failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            e @ AppError::InvalidSignature => (StatusCode::BAD_REQUEST, e.to_string()),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::model::MetricKind;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::from(ValidationError::InvalidKind { kind: "x".into() }), StatusCode::BAD_REQUEST),
            (AppError::from(EngineError::not_found(MetricKind::Counter, "hits")), StatusCode::NOT_FOUND),
            (
                AppError::from(EngineError::from(StorageError::CounterOverflow { name: "hits".into() })),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::InvalidSignature, StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_display_passes_engine_errors_through() {
        assert_eq!(AppError::InvalidSignature.to_string(), "invalid signature");

        let engine = EngineError::not_found(MetricKind::Gauge, "temp");
        let expected = engine.to_string();
        let err = AppError::from(engine);
        assert_eq!(err.to_string(), expected);
        assert!(matches!(err, AppError::Engine(EngineError::NotFound { .. })));
    }
}

/// Unified error handling module
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Unified error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Accept, connect, read and write failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Undecodable or schema-violating payload
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("Timed out acquiring {0} lock")]
    LockTimeout(&'static str),

    #[error("Timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RelayError {
    /// Transient failures are retried or skipped for the current cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::LockTimeout(_) | RelayError::Timeout(..)
        )
    }

    fn code(&self) -> &'static str {
        match self {
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Protocol(_) | RelayError::FrameTooLarge { .. } => "PROTOCOL_ERROR",
            RelayError::LockTimeout(_) => "LOCK_TIMEOUT",
            RelayError::Timeout(..) => "TIMEOUT",
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::InvalidInput(_) => "INVALID_INPUT",
            RelayError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RelayError::LockTimeout(_) | RelayError::Timeout(..) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_response = ErrorResponse {
            ok: false,
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// Type alias for relay results
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_transient() {
        assert!(RelayError::LockTimeout("buffer").is_transient());
        assert!(!RelayError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = RelayError::NotFound("drone9".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_display_names_lock_domain() {
        let err = RelayError::LockTimeout("operational state");
        assert_eq!(err.to_string(), "Timed out acquiring operational state lock");
    }
}

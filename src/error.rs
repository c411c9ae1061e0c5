//! Error handling module
//!
//! HTTP-facing error type and response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::LedgerError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    // Ledger errors carry their own status
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // Server errors (5xx)
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Whether the same request may simply be sent again
    pub retry_safe: bool,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) | AppError::MissingHeader(_) | AppError::InvalidHeader(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Ledger(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::Internal(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::MissingHeader(_) => "missing_header",
            AppError::InvalidHeader(_) => "invalid_header",
            AppError::Ledger(e) => e.error_code(),
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (details, retry_safe) = match &self {
            AppError::InvalidRequest(msg) => (Some(msg.clone()), false),
            AppError::MissingHeader(header) | AppError::InvalidHeader(header) => {
                (Some(header.clone()), false)
            }
            AppError::Ledger(e) => {
                if e.requires_manual_intervention() {
                    tracing::error!(error = %e, error_code = e.error_code(), "Ledger left needing reconciliation");
                } else if status.is_server_error() {
                    tracing::error!(error = %e, error_code = e.error_code(), "Ledger operation failed");
                }
                let details = matches!(e, LedgerError::StepFailed { .. })
                    .then(|| e.root().to_string());
                (details, e.is_retry_safe())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (None, false)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (None, false)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
            details,
            retry_safe,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordStatus, Transition};
    use uuid::Uuid;

    #[test]
    fn test_ledger_error_status() {
        let err = AppError::from(LedgerError::not_found("debt", Uuid::new_v4()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "not_found");

        let err = AppError::from(LedgerError::invalid_transition(
            Uuid::new_v4(),
            RecordStatus::Reversed,
            Transition::Reverse,
        ));
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_missing_header_is_bad_request() {
        let err = AppError::MissingHeader("X-Request-User-Id".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "missing_header");
    }
}

//! Centralized error types for the Murmur core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Murmur gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller presented no credential, or one that failed verification.
    ///
    /// The message is returned verbatim in the response body; handlers use
    /// the exact phrasings the capture frontends match on.
    #[error("{0}")]
    Unauthorized(String),

    /// Request came from an origin outside the allowlist.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Requested archive object or session does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream speech-to-text call failed.
    #[error("Transcription failed: {0}")]
    Transcription(String),

    /// Object-store or ticket-store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Transcription(_) => "transcription_failed",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// JSON response body for error responses.
///
/// The `error` field carries the human-readable message because the ticket
/// endpoint's clients match on it (e.g. "Missing Authorization header").
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    status: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_401_and_keeps_message_verbatim() {
        let err = GatewayError::Unauthorized("Missing Authorization header".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "Missing Authorization header");
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn configuration_maps_to_503() {
        let err = GatewayError::Configuration("no JWT key".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = GatewayError::NotFound("session_x".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}

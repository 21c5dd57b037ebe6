//! # Error Handling
//!
//! This module defines custom error types and how they're converted to HTTP responses.
//!
//! ## Error Categories:
//! - **NotFound**: A referenced session or connection doesn't exist (404). Never
//!   retried internally; absence is terminal for the caller.
//! - **AlreadyActive**: A second start on a session whose translation channel is
//!   already open (409). Surfaced, not fatal - the original channel is unaffected.
//! - **InvalidConfig / InvalidOffer**: Malformed caller input (400).
//! - **UpstreamUnavailable**: The cloud speech/avatar service is unreachable or
//!   answered non-2xx (502). Kept distinct from NotFound so callers can tell
//!   "your session doesn't exist" from "the cloud service is down".
//! - **Internal**: Everything else (500).
//!
//! ## Why custom errors:
//! Custom error types make it easy to handle different failure scenarios
//! and provide meaningful error messages to API clients.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::NotFound(format!("Session '{}' not found", code)));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Referenced session or connection doesn't exist
    NotFound(String),

    /// Translation already running for this session
    AlreadyActive(String),

    /// Session configuration from the caller failed validation
    InvalidConfig(String),

    /// Malformed or missing SDP offer / signaling input
    InvalidOffer(String),

    /// External speech/avatar service unreachable or failing
    UpstreamUnavailable(String),

    /// Internal server errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::AlreadyActive(msg) => write!(f, "Already active: {}", msg),
            AppError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            AppError::InvalidOffer(msg) => write!(f, "Invalid offer: {}", msg),
            AppError::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts our custom errors into HTTP responses that clients can understand.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session '123456' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::AlreadyActive(msg) => (
                actix_web::http::StatusCode::CONFLICT,
                "already_active",
                msg.clone(),
            ),
            AppError::InvalidConfig(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "invalid_config",
                msg.clone(),
            ),
            AppError::InvalidOffer(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "invalid_offer",
                msg.clone(),
            ),
            AppError::UpstreamUnavailable(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client sending malformed data,
/// so they map to a 400-class error rather than a 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidConfig(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(format!("Configuration error: {}", err))
    }
}

/// Negotiation and token calls to the avatar service go through reqwest; any
/// transport-level failure there is an upstream outage from the caller's view.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::UpstreamUnavailable(err.to_string())
    }
}

/// The streaming recognition channel is a tokio-tungstenite WebSocket; a failed
/// dial or broken stream is likewise an upstream outage.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::UpstreamUnavailable(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let cases = [
            (AppError::NotFound("x".into()), 404),
            (AppError::AlreadyActive("x".into()), 409),
            (AppError::InvalidConfig("x".into()), 400),
            (AppError::InvalidOffer("x".into()), 400),
            (AppError::UpstreamUnavailable("x".into()), 502),
            (AppError::Internal("x".into()), 500),
        ];

        for (err, expected) in cases {
            assert_eq!(err.error_response().status().as_u16(), expected);
        }
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AppError::NotFound("Session '123456' not found".to_string());
        assert!(err.to_string().contains("123456"));
    }
}

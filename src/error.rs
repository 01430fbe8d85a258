//! Error handling for VA31 Opsdeck

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid task state transition
    #[error("Invalid state transition: {from} -> {requested}")]
    InvalidTransition { from: String, requested: String },

    /// Device handle held by another consumer
    #[error("Device {index} busy: {message}")]
    DeviceBusy { index: u32, message: String },

    /// Capture failure (open/read on a device)
    #[error("Capture error: {0}")]
    Capture(String),

    /// Pipeline service returned an error response
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Realtime channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::InvalidTransition { from, requested } => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                format!("cannot transition from '{}' to '{}'", from, requested),
            ),
            Error::DeviceBusy { index, message } => (
                StatusCode::CONFLICT,
                "DEVICE_BUSY",
                format!("device {}: {}", index, message),
            ),
            Error::Capture(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CAPTURE_ERROR",
                msg.clone(),
            ),
            Error::Pipeline(msg) => (StatusCode::BAD_GATEWAY, "PIPELINE_ERROR", msg.clone()),
            Error::Channel(msg) => (StatusCode::BAD_GATEWAY, "CHANNEL_ERROR", msg.clone()),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", msg.clone()),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

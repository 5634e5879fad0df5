//! # Error Handling
//!
//! HTTP-facing error type. Domain errors (`VoiceError`, `PlanningError`) convert
//! into [`AppError`], which renders as JSON with a status code that tells the
//! operator whose fault it was.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "permission_denied",
//!     "message": "microphone permission denied: ...",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## HTTP Status Code Mapping:
//! - BadRequest / ValidationError → 400
//! - PermissionDenied → 403
//! - NotFound → 404
//! - Upstream (agent or planning collaborator unreachable or failing) → 502
//! - Internal / ConfigError → 500

use crate::planning::PlanningError;
use crate::voice::VoiceError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Server-side failures
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input parsed but failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Microphone access refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The agent or a planning collaborator failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl AppError {
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::Upstream(_) => "upstream_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::PermissionDenied(msg)
            | AppError::Upstream(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(_) => AppError::PermissionDenied(err.to_string()),
            VoiceError::ConnectionError(_) => AppError::Upstream(err.to_string()),
            VoiceError::ProtocolError(_) | VoiceError::DecodeError(_) | VoiceError::DeviceError(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<PlanningError> for AppError {
    fn from(err: PlanningError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

use crate::db::errors::DbError;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Token missing, malformed, unknown, stale or fingerprint-mismatched
    #[error("Invalid token")]
    InvalidToken { message: Option<String> },

    /// Username/password combination rejected at login
    #[error("Invalid username or password")]
    InvalidLogin,

    /// Rate or limiter threshold exceeded
    #[error("Too many requests, retry in {retry_after_ms}ms")]
    TooManyRequests { retry_after_ms: u64 },

    /// Valid session without the permission the route requires
    #[error("Missing permission {required}")]
    PermissionDenied { required: String },

    /// Durable store timed out or is unreachable. Retryable, never an auth failure.
    #[error("Session store unavailable while trying to {operation}")]
    StoreUnavailable { operation: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Request conflicts with existing state
    #[error("{message}")]
    Conflict { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidToken { .. } | Error::InvalidLogin => StatusCode::UNAUTHORIZED,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable, machine-parsable reason code returned in every error body
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::InvalidToken { .. } => "invalid_token",
            Error::InvalidLogin => "invalid_login",
            Error::TooManyRequests { .. } => "too_many_requests",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::BadRequest { .. } => "bad_request",
            Error::Conflict { .. } => "conflict",
            Error::Database(DbError::NotFound) => "not_found",
            Error::Database(DbError::UniqueViolation { .. }) => "conflict",
            Error::Database(DbError::ForeignKeyViolation { .. }) => "bad_request",
            Error::Internal { .. } | Error::Database(DbError::Other(_)) | Error::Other(_) => "internal_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidToken { message } => message.clone().unwrap_or_else(|| "Invalid Token".to_string()),
            Error::InvalidLogin => "Invalid username or password".to_string(),
            Error::TooManyRequests { .. } => "Too Many Requests".to_string(),
            Error::PermissionDenied { required } => format!("Missing permission {required}"),
            Error::StoreUnavailable { .. } => "Service temporarily unavailable, please retry".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Conflict { message } => message.clone(),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { table, constraint, .. } => match (table.as_deref(), constraint.as_deref()) {
                    (Some("users"), Some(c)) if c.contains("username") => "This username is already taken".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::StoreUnavailable { .. } => {
                tracing::error!("Infrastructure error: {}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::PermissionDenied { .. } | Error::InvalidLogin => {
                tracing::info!("Authorization error: {}", self);
            }
            // Rejected tokens and throttled clients are routine; logging them at info floods the logs
            Error::InvalidToken { .. } | Error::TooManyRequests { .. } => {
                tracing::debug!("Rejected request: {}", self);
            }
            Error::BadRequest { .. } | Error::Conflict { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let mut body = json!({
            "error": self.reason_code(),
            "message": self.user_message(),
        });

        match &self {
            Error::TooManyRequests { retry_after_ms } => {
                body["retry_after_ms"] = json!(retry_after_ms);
                let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
                let mut response = (status, Json(body)).into_response();
                response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            Error::PermissionDenied { required } => {
                body["required"] = json!(required);
                (status, Json(body)).into_response()
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::{
    remote::RemoteError,
    services::{entity_store::StoreError, sync_engine::SyncError},
};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvariantViolation(_) => Self::new(StatusCode::CONFLICT, err.to_string()),
            StoreError::Sqlx(sqlx::Error::RowNotFound) => Self::not_found(err.to_string()),
            other => {
                tracing::error!("store error: {}", other);
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AccessDenied(_) => Self::new(StatusCode::FORBIDDEN, err.to_string()),
            RemoteError::NoSuchBucket(_) => Self::not_found(err.to_string()),
            RemoteError::Timeout(_) | RemoteError::Throttled(_) | RemoteError::Network(_) => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(inner) => inner.into(),
            SyncError::PermissionDenied(inner) | SyncError::Remote(inner) => inner.into(),
            SyncError::RetriesExhausted { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            SyncError::Protocol(_) => Self::internal(err.to_string()),
        }
    }
}

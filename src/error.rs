//! Maintenance error taxonomy
//!
//! Repositories and remote clients return `anyhow` errors; the service layer
//! classifies them into [MaintenanceError] so handlers can map each class to a
//! status code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("server {0} not configured")]
    NotConfigured(i64),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("item is excluded from this rule")]
    Excluded,

    #[error("item was excluded while the deletion was pending")]
    NewlyExcluded,

    #[error("{operation} failed: {message}")]
    Upstream { operation: String, message: String },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type MaintenanceResult<T> = std::result::Result<T, MaintenanceError>;

impl MaintenanceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn upstream(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Upstream {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotConfigured(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::Excluded | Self::NewlyExcluded => StatusCode::CONFLICT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NotConfigured(_) => "not_configured",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Excluded => "excluded",
            Self::NewlyExcluded => "newly_excluded",
            Self::Upstream { .. } => "upstream",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for MaintenanceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for MaintenanceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(MaintenanceError::not_found("rule", 4).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(MaintenanceError::NotConfigured(1).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            MaintenanceError::Conflict("sync already running".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MaintenanceError::upstream("delete", "HTTP 500").to_string(),
            "delete failed: HTTP 500"
        );
    }

    #[test]
    fn test_anyhow_becomes_internal() {
        let err: MaintenanceError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.code(), "internal");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

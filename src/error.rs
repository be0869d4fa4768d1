//! Error taxonomy shared by every engine component.
//!
//! `SlaError` is the single error type surfaced by the aggregator, bulk loader,
//! registry client and reconciliation service. It converts into an HTTP
//! response at the route boundary, so handlers simply return `Result<_, SlaError>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::ApiResponse;

// ---

/// Storage failures, split so constraint-class errors can be told apart from
/// genuine backend failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Integrity constraint violation (SQLSTATE class 23).
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        // ---
        if let sqlx::Error::Database(db) = &err {
            if db.code().is_some_and(|code| code.starts_with("23")) {
                return StorageError::Constraint(db.message().to_string());
            }
        }
        StorageError::Backend(err.to_string())
    }
}

impl StorageError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, StorageError::Constraint(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlaError {
    /// Caller supplied an invalid range, period, file or parameter.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Registry or NMS unreachable, non-2xx, or returned a malformed body.
    #[error("upstream {service} failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    #[error("{0} is not configured")]
    RegistryNotConfigured(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SlaResult<T> = Result<T, SlaError>;

impl SlaError {
    pub fn validation(message: impl Into<String>) -> Self {
        SlaError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        SlaError::NotFound(message.into())
    }

    pub fn upstream(service: &'static str, message: impl ToString) -> Self {
        SlaError::Upstream {
            service,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        // ---
        match self {
            SlaError::Validation(_) | SlaError::Spreadsheet(_) => StatusCode::BAD_REQUEST,
            SlaError::NotFound(_) => StatusCode::NOT_FOUND,
            SlaError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            SlaError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SlaError::Storage(StorageError::Constraint(_)) => StatusCode::CONFLICT,
            SlaError::RegistryNotConfigured(_)
            | SlaError::Storage(_)
            | SlaError::Export(_)
            | SlaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for SlaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SlaError::not_found("Resource not found"),
            other => SlaError::Storage(other.into()),
        }
    }
}

impl From<reqwest::Error> for SlaError {
    fn from(err: reqwest::Error) -> Self {
        SlaError::upstream("http", err)
    }
}

impl IntoResponse for SlaError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status_code();
        match status {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                tracing::debug!(error = %self, status = %status, "request rejected");
            }
            _ => tracing::error!(error = %self, status = %status, "request failed"),
        }

        // Storage details stay in the log.
        let message = match &self {
            SlaError::Storage(StorageError::Backend(_)) => "Database error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ApiResponse::<()>::failure(message))).into_response()
    }
}

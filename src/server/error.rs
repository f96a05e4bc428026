//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`crate::Error`] so that route handlers
//! can return `Result<T, AppError>` and bubble failures with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for the crate error type.
pub struct AppError {
    inner: crate::Error,
}

impl AppError {
    pub fn new(inner: crate::Error) -> Self {
        Self { inner }
    }
}

impl From<crate::Error> for AppError {
    fn from(e: crate::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let code = match &self.inner {
            crate::Error::StaleIndex => "stale_index",
            crate::Error::Scan { .. } => "scan_error",
            crate::Error::UnsupportedFormat(_) => "unsupported_format",
            crate::Error::NoSegmentsFound => "no_segments_found",
            crate::Error::NotFound { .. } => "not_found",
            crate::Error::Validation(_) => "validation_error",
            crate::Error::Io { .. } => "io_error",
            crate::Error::Internal(_) => "internal_error",
        };

        let body = json!({
            "error": self.inner.to_string(),
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

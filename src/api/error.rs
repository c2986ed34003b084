//! Mapping pipeline errors onto HTTP responses.
//!
//! The status mapping lives here and nowhere else. Error bodies are JSON
//! `{error, message, details}` where `error` is the machine-readable kind.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::errors::GenerateError;

/// An error ready to leave the HTTP layer.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Machine-readable kind.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// A 404 with an explicit kind (used where no `GenerateError` maps,
    /// e.g. a config that never produced history).
    #[must_use]
    pub fn not_found(error: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: error.to_owned(),
            message: message.into(),
            details: None,
        }
    }

    /// A 400 for requests the router cannot even parse into an operation.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "BadRequest".to_owned(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<GenerateError> for ApiError {
    fn from(e: GenerateError) -> Self {
        let status = match &e {
            GenerateError::InvalidName(_) | GenerateError::ConfigInvalid { .. } => {
                StatusCode::BAD_REQUEST
            }
            GenerateError::ConfigNotFound { .. } | GenerateError::ExtMismatch { .. } => {
                StatusCode::NOT_FOUND
            }
            GenerateError::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
            GenerateError::TemplateFailed { .. }
            | GenerateError::RasterFailed { .. }
            | GenerateError::CacheReadFailed { .. }
            | GenerateError::CacheWriteFailed { .. }
            | GenerateError::HistoryAppendFailed { .. }
            | GenerateError::WorkerCrashed { .. }
            | GenerateError::TempCleanupFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let details = match &e {
            GenerateError::ExtMismatch { expected, requested, .. } => Some(json!({
                "expected": expected,
                "requested": requested,
            })),
            GenerateError::ConfigInvalid { reason, .. } => Some(json!({ "reason": reason })),
            _ => None,
        };

        Self {
            status,
            error: e.kind().to_owned(),
            message: e.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.error, message = %self.message, "Request failed");
        } else {
            tracing::debug!(error = %self.error, message = %self.message, "Request rejected");
        }
        let body = json!({
            "error": self.error,
            "message": self.message,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases: Vec<(GenerateError, StatusCode)> = vec![
            (
                GenerateError::ConfigNotFound { id: "zz".to_owned() },
                StatusCode::NOT_FOUND,
            ),
            (
                GenerateError::ConfigInvalid {
                    id: "a".to_owned(),
                    reason: "bad".to_owned(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                GenerateError::ExtMismatch {
                    id: "a".to_owned(),
                    expected: "png".to_owned(),
                    requested: "bmp".to_owned(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GenerateError::FetchFailed {
                    url: "https://example.com".to_owned(),
                    source: anyhow::anyhow!("boom"),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                GenerateError::RasterFailed {
                    source: anyhow::anyhow!("boom"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, expected, "{}", api.error);
        }
    }

    #[test]
    fn ext_mismatch_carries_hint_details() {
        let api: ApiError = GenerateError::ExtMismatch {
            id: "a".to_owned(),
            expected: "png".to_owned(),
            requested: "bmp".to_owned(),
        }
        .into();
        let details = api.details.unwrap();
        assert_eq!(details["expected"], "png");
        assert_eq!(details["requested"], "bmp");
    }
}

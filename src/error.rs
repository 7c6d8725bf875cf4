//! # Error Handling
//!
//! Two layers live here. [`ReindexError`] is the domain taxonomy surfaced by the
//! cursor tracker, batch copier, state machine, dispatcher and registry.
//! [`ApiError`] is the problem+json envelope returned by the operator status
//! surface, with trace ID propagation.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::telemetry;

/// Errors produced by the reindex orchestration core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReindexError {
    /// Corrupt cursor, or a cursor minted for another key space.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    /// Network, timeout or rate-limit failure talking to a collection.
    #[error("transient copy failure: {0}")]
    TransientCopy(String),
    /// Schema, authorization or malformed-document failure.
    #[error("fatal copy failure: {0}")]
    FatalCopy(String),
    #[error("job {job_id} already has a live execution")]
    DuplicateJob { job_id: Uuid },
    #[error("worker for job {job_id} was lost: {reason}")]
    LostWorker { job_id: Uuid, reason: String },
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },
    /// Another writer advanced the job; this execution no longer owns it.
    #[error("write authority over job {0} was lost")]
    AuthorityLost(Uuid),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("execution backend error: {0}")]
    Execution(String),
}

impl ReindexError {
    /// Whether the state machine may retry the failed batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReindexError::TransientCopy(_))
    }

    /// Stable machine-readable code, used for problem+json and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            ReindexError::InvalidCursor(_) => "INVALID_CURSOR",
            ReindexError::TransientCopy(_) => "TRANSIENT_COPY",
            ReindexError::FatalCopy(_) => "FATAL_COPY",
            ReindexError::DuplicateJob { .. } => "DUPLICATE_JOB",
            ReindexError::LostWorker { .. } => "LOST_WORKER",
            ReindexError::JobNotFound(_) => "NOT_FOUND",
            ReindexError::InvalidSpec(_) => "VALIDATION_FAILED",
            ReindexError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            ReindexError::AuthorityLost(_) => "AUTHORITY_LOST",
            ReindexError::Storage(_) => "STORAGE_ERROR",
            ReindexError::Execution(_) => "EXECUTION_ERROR",
        }
    }
}

impl From<sea_orm::DbErr> for ReindexError {
    fn from(error: sea_orm::DbErr) -> Self {
        tracing::error!(error = ?error, "Job registry storage error");
        ReindexError::Storage(error.to_string())
    }
}

/// Suggested client back-off while the registry database is unavailable.
const REGISTRY_RETRY_AFTER_SECS: u64 = 5;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ReindexError> for ApiError {
    fn from(error: ReindexError) -> Self {
        let status = match &error {
            ReindexError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ReindexError::InvalidSpec(_) | ReindexError::InvalidCursor(_) => {
                StatusCode::BAD_REQUEST
            }
            ReindexError::DuplicateJob { .. }
            | ReindexError::IllegalTransition { .. }
            | ReindexError::AuthorityLost(_) => StatusCode::CONFLICT,
            ReindexError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %error, "Reindex request failed");
        }

        let code = error.code();
        let message = error.to_string();
        let api_error = ApiError::new(status, code.to_string(), message);

        match error {
            ReindexError::JobNotFound(job_id)
            | ReindexError::DuplicateJob { job_id }
            | ReindexError::AuthorityLost(job_id) => {
                api_error.with_details(json!({ "job_id": job_id }))
            }
            ReindexError::IllegalTransition { job_id, from, to } => {
                api_error.with_details(json!({ "job_id": job_id, "from": from, "to": to }))
            }
            ReindexError::Storage(_) => api_error.with_retry_after(REGISTRY_RETRY_AFTER_SECS),
            _ => api_error,
        }
    }
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_failures_are_retryable() {
        assert!(ReindexError::TransientCopy("timeout".into()).is_retryable());
        assert!(!ReindexError::FatalCopy("schema".into()).is_retryable());
        assert!(!ReindexError::InvalidCursor("bad".into()).is_retryable());
        assert!(!ReindexError::AuthorityLost(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn test_job_not_found_maps_to_404() {
        let job_id = Uuid::new_v4();
        let api_error: ApiError = ReindexError::JobNotFound(job_id).into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert_eq!(api_error.code, Box::from("NOT_FOUND"));
        let details = api_error.details.expect("details");
        assert_eq!(details["job_id"], json!(job_id));
    }

    #[test]
    fn test_duplicate_job_maps_to_409() {
        let api_error: ApiError = ReindexError::DuplicateJob {
            job_id: Uuid::new_v4(),
        }
        .into();

        assert_eq!(api_error.status, StatusCode::CONFLICT);
        assert_eq!(api_error.code, Box::from("DUPLICATE_JOB"));
    }

    #[test]
    fn test_invalid_spec_maps_to_validation_failed() {
        let api_error: ApiError = ReindexError::InvalidSpec("batch_size must be > 0".into()).into();

        assert_eq!(api_error.status, StatusCode::BAD_REQUEST);
        assert_eq!(api_error.code, Box::from("VALIDATION_FAILED"));
        assert!(api_error.message.contains("batch_size"));
    }

    #[test]
    fn test_illegal_transition_details() {
        let api_error: ApiError = ReindexError::IllegalTransition {
            job_id: Uuid::new_v4(),
            from: "completed".into(),
            to: "running".into(),
        }
        .into();

        assert_eq!(api_error.status, StatusCode::CONFLICT);
        let details = api_error.details.expect("details");
        assert_eq!(details["from"], "completed");
        assert_eq!(details["to"], "running");
    }

    #[test]
    fn test_storage_error_suggests_retry() {
        let api_error: ApiError = ReindexError::Storage("pool timed out".into()).into();

        assert_eq!(api_error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api_error.retry_after, Some(REGISTRY_RETRY_AFTER_SECS));
    }

    #[test]
    fn test_content_type_and_retry_after_headers() {
        let response = ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Registry unavailable",
        )
        .with_retry_after(30)
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");
    }

    #[test]
    fn test_trace_id_generation() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "Test error");

        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_validation_error_helper() {
        let error = validation_error("Invalid status filter", json!({"status": "unknown"}));

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(json!({"status": "unknown"}))));
    }
}

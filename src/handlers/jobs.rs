//! # Jobs API Handlers
//!
//! Read-only views of reindex jobs for operators.

use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::{FailureCause, JobState, JobStatus};
use crate::server::AppState;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 100;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// Filter by job status (one of: pending, running, paused, failed, completed)
    pub status: Option<String>,
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u64>,
}

/// Operator view of one reindex job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobStatusView {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: Uuid,
    pub status: JobStatus,
    /// Source collection as `{base_url}/{collection}`
    #[schema(example = "http://solr:8983/solr/products_v1")]
    pub source: String,
    #[schema(example = "http://solr:8983/solr/products_v2")]
    pub target: String,
    /// Opaque resume cursor; `*` before the first batch
    pub cursor: String,
    #[schema(example = 12500)]
    pub docs_copied: u64,
    #[schema(example = 25)]
    pub batches_completed: u64,
    #[schema(example = 0)]
    pub retry_count: u32,
    #[schema(example = 3)]
    pub max_retries: u32,
    #[schema(example = 500)]
    pub batch_size: u32,
    /// Present only for failed jobs
    pub last_error: Option<FailureCause>,
    pub pause_requested: bool,
    pub execution_id: Option<Uuid>,
    pub resumed_from: Option<Uuid>,
    pub version: i64,
    #[schema(example = "2025-06-02T09:00:00Z")]
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub heartbeat_at: Option<String>,
}

/// Response payload for the jobs listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    /// Jobs ordered by creation time, newest first
    pub jobs: Vec<JobStatusView>,
}

impl From<JobState> for JobStatusView {
    fn from(state: JobState) -> Self {
        Self {
            id: state.id,
            status: state.status,
            source: state.spec.source.to_string(),
            target: state.spec.target.to_string(),
            cursor: state.cursor.into_inner(),
            docs_copied: state.docs_copied,
            batches_completed: state.batches_completed,
            retry_count: state.retry_count,
            max_retries: state.spec.retry.max_retries,
            batch_size: state.spec.batch_size,
            last_error: state.last_error,
            pause_requested: state.pause_requested,
            execution_id: state.execution_id,
            resumed_from: state.resumed_from,
            version: state.version,
            created_at: state.created_at.to_rfc3339(),
            updated_at: state.updated_at.to_rfc3339(),
            started_at: state.started_at.map(|dt| dt.to_rfc3339()),
            finished_at: state.finished_at.map(|dt| dt.to_rfc3339()),
            heartbeat_at: state.heartbeat_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// List reindex jobs
#[utoipa::path(
    get,
    path = "/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs matching the filter", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 503, description = "Job registry unavailable", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = match params.limit {
        Some(0) => {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
            ));
        }
        Some(limit) if limit > MAX_LIMIT => {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({ "limit": format!("Maximum allowed limit is {}", MAX_LIMIT) }),
            ));
        }
        Some(limit) => limit,
        None => DEFAULT_LIMIT,
    };

    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(JobStatus::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
            validation_error(
                "Invalid status",
                serde_json::json!({
                    "status": "Must be one of: pending, running, paused, failed, completed"
                }),
            )
        })?),
    };

    let jobs = state.registry.list(status, limit).await?;

    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobStatusView::from).collect(),
    }))
}

/// Get one reindex job
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Job state", body = JobStatusView),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 503, description = "Job registry unavailable", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job = state.registry.get(id).await?;
    Ok(Json(job.into()))
}

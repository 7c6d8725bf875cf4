//! # Job Registry
//!
//! Durable mapping of job id to [`JobState`], shared by the operator surface,
//! the dispatcher and every worker. State changes go through
//! [`JobRegistry::compare_and_set`] against the snapshot the caller last read;
//! nothing overwrites a job unconditionally.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::ReindexError;
use crate::models::job_spec::ReindexJobSpec;
use crate::models::job_state::{JobState, JobStatus};

pub mod database;
pub mod memory;

pub use database::DatabaseJobRegistry;
pub use memory::InMemoryJobRegistry;

/// Attempts made by [`update_job`] before giving up under contention.
const MAX_CAS_ATTEMPTS: usize = 8;

#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Store a new job. Fails if the id is already taken.
    async fn insert(&self, state: JobState) -> Result<Uuid, ReindexError>;

    /// Current snapshot, or `JobNotFound`.
    async fn get(&self, job_id: Uuid) -> Result<JobState, ReindexError>;

    /// Replace the stored job with `new` if it still matches `expected`
    /// (same version and status). On success the stored version is
    /// `expected.version + 1`. Returns `false` when another writer got there
    /// first.
    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: &JobState,
        new: JobState,
    ) -> Result<bool, ReindexError>;

    /// Most recently created jobs first.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<JobState>, ReindexError>;

    /// Every `Pending` or `Running` job that holds an execution assignment,
    /// oldest heartbeat first.
    async fn list_assigned(&self) -> Result<Vec<JobState>, ReindexError>;

    /// Validate the spec and create a `Pending` job.
    async fn create(&self, spec: ReindexJobSpec) -> Result<Uuid, ReindexError> {
        let spec = spec.validate()?;
        let state = JobState::new(spec, Utc::now());
        let job_id = self.insert(state).await?;
        tracing::info!(job_id = %job_id, "Reindex job created");
        Ok(job_id)
    }

    /// Create a new `Pending` job continuing a failed one from its last cursor.
    async fn create_resume(&self, failed_job_id: Uuid) -> Result<Uuid, ReindexError> {
        let failed = self.get(failed_job_id).await?;
        let state = JobState::resumed_from(&failed, Utc::now())?;
        let job_id = self.insert(state).await?;
        tracing::info!(
            job_id = %job_id,
            resumed_from = %failed_job_id,
            cursor = %failed.cursor,
            "Resume job created from failed job"
        );
        Ok(job_id)
    }

    /// Raise the pause signal; the running worker parks the job between batches.
    async fn request_pause(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        update_job(self, job_id, |state| state.request_pause(Utc::now())).await
    }
}

/// Read-modify-CAS loop for operator-initiated changes. Retries when a worker
/// advances the job concurrently.
pub async fn update_job<R, F>(registry: &R, job_id: Uuid, change: F) -> Result<JobState, ReindexError>
where
    R: JobRegistry + ?Sized,
    F: Fn(&JobState) -> Result<JobState, ReindexError> + Send + Sync,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = registry.get(job_id).await?;
        let next = change(&current)?;
        if registry.compare_and_set(job_id, &current, next.clone()).await? {
            return Ok(next);
        }
        tracing::debug!(job_id = %job_id, "Job changed concurrently, retrying update");
    }

    Err(ReindexError::Storage(format!(
        "job {} kept changing; gave up after {} attempts",
        job_id, MAX_CAS_ATTEMPTS
    )))
}

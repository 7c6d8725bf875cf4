//! Reindex job state
//!
//! [`JobState`] is the durable record of one job. Every transition of the
//! state machine is a pure function from one snapshot to the next; the job
//! registry persists the result with compare-and-set against the previous
//! snapshot's `version`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::copier::BatchResult;
use crate::cursor::Cursor;
use crate::error::ReindexError;
use crate::models::job_spec::ReindexJobSpec;

/// Lifecycle status of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }

    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ReindexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "failed" => Ok(JobStatus::Failed),
            "completed" => Ok(JobStatus::Completed),
            other => Err(ReindexError::Storage(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidCursor,
    TransientExhausted,
    FatalCopy,
    LostWorker,
    Cancelled,
}

/// Persisted last error of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FailureCause {
    pub kind: FailureKind,
    #[schema(example = "transient copy failure: HTTP 503 from source")]
    pub message: String,
}

impl FailureCause {
    pub fn new<S: Into<String>>(kind: FailureKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a state-machine error into a persisted cause.
    pub fn from_error(error: &ReindexError) -> Self {
        let kind = match error {
            ReindexError::InvalidCursor(_) => FailureKind::InvalidCursor,
            ReindexError::TransientCopy(_) => FailureKind::TransientExhausted,
            ReindexError::LostWorker { .. } => FailureKind::LostWorker,
            _ => FailureKind::FatalCopy,
        };
        Self::new(kind, error.to_string())
    }
}

/// Durable snapshot of a reindex job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: Uuid,
    pub spec: ReindexJobSpec,
    pub status: JobStatus,
    /// Last acknowledged position in the source collection
    pub cursor: Cursor,
    pub docs_copied: u64,
    pub batches_completed: u64,
    /// Consecutive transient failures of the in-flight batch
    pub retry_count: u32,
    /// Present only when `status` is `Failed`
    pub last_error: Option<FailureCause>,
    /// Operator asked for a pause; observed between batches
    pub pause_requested: bool,
    /// Execution unit currently holding write authority
    pub execution_id: Option<Uuid>,
    /// Failed job this one was seeded from
    pub resumed_from: Option<Uuid>,
    /// Compare-and-set fencing token, incremented on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl JobState {
    /// A fresh `Pending` job positioned at the start of the source.
    pub fn new(spec: ReindexJobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: JobStatus::Pending,
            cursor: Cursor::start(),
            docs_copied: 0,
            batches_completed: 0,
            retry_count: 0,
            last_error: None,
            pause_requested: false,
            execution_id: None,
            resumed_from: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
        }
    }

    /// A `Pending` job that continues a failed job from its last cursor.
    pub fn resumed_from(failed: &JobState, now: DateTime<Utc>) -> Result<Self, ReindexError> {
        if failed.status != JobStatus::Failed {
            return Err(ReindexError::IllegalTransition {
                job_id: failed.id,
                from: failed.status.to_string(),
                to: "resumed".to_string(),
            });
        }

        let mut job = JobState::new(failed.spec.clone(), now);
        job.cursor = failed.cursor.clone();
        job.docs_copied = failed.docs_copied;
        job.batches_completed = failed.batches_completed;
        job.resumed_from = Some(failed.id);
        Ok(job)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `execution_id` currently holds write authority.
    pub fn is_owned_by(&self, execution_id: Uuid) -> bool {
        self.execution_id == Some(execution_id)
    }

    fn next(&self, now: DateTime<Utc>) -> JobState {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = now;
        next
    }

    fn illegal(&self, to: JobStatus) -> ReindexError {
        ReindexError::IllegalTransition {
            job_id: self.id,
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    fn running(&self, execution_id: Uuid, now: DateTime<Utc>) -> JobState {
        let mut next = self.next(now);
        next.status = JobStatus::Running;
        next.execution_id = Some(execution_id);
        next.started_at = self.started_at.or(Some(now));
        next.heartbeat_at = Some(now);
        next
    }

    /// `Pending -> Running`
    pub fn start(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Pending => Ok(self.running(execution_id, now)),
            _ => Err(self.illegal(JobStatus::Running)),
        }
    }

    /// `Paused -> Running`
    pub fn resume(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Paused => Ok(self.running(execution_id, now)),
            _ => Err(self.illegal(JobStatus::Running)),
        }
    }

    /// `Running -> Running` under a new execution, after the previous one crashed.
    /// The persisted cursor is kept.
    pub fn reclaim(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Running => {
                let mut next = self.running(execution_id, now);
                next.retry_count = 0;
                Ok(next)
            }
            _ => Err(self.illegal(JobStatus::Running)),
        }
    }

    /// Take write authority for `execution_id` from whichever non-terminal
    /// state the job is in.
    pub fn claim(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Pending => self.start(execution_id, now),
            JobStatus::Paused => self.resume(execution_id, now),
            JobStatus::Running => self.reclaim(execution_id, now),
            JobStatus::Failed | JobStatus::Completed => Err(self.illegal(JobStatus::Running)),
        }
    }

    /// Successful batch: advance the cursor, add counts, reset retries.
    pub fn record_batch(
        &self,
        batch: &BatchResult,
        now: DateTime<Utc>,
    ) -> Result<JobState, ReindexError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal(JobStatus::Running));
        }
        let mut next = self.next(now);
        next.cursor = batch.cursor.clone();
        next.docs_copied = self.docs_copied + batch.docs_written as u64;
        next.batches_completed = self.batches_completed + 1;
        next.retry_count = 0;
        next.heartbeat_at = Some(now);
        Ok(next)
    }

    /// Transient failure of the in-flight batch.
    pub fn record_retry(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal(JobStatus::Running));
        }
        let mut next = self.next(now);
        next.retry_count = self.retry_count.saturating_add(1);
        next.heartbeat_at = Some(now);
        Ok(next)
    }

    /// Liveness signal from the execution unit.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.is_terminal() {
            return Err(self.illegal(self.status));
        }
        let mut next = self.next(now);
        next.heartbeat_at = Some(now);
        Ok(next)
    }

    /// `Running -> Completed`
    pub fn complete(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal(JobStatus::Completed));
        }
        let mut next = self.next(now);
        next.status = JobStatus::Completed;
        next.retry_count = 0;
        next.pause_requested = false;
        next.finished_at = Some(now);
        Ok(next)
    }

    /// Any non-terminal state `-> Failed`, keeping the last good cursor.
    pub fn fail(&self, cause: FailureCause, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.is_terminal() {
            return Err(self.illegal(JobStatus::Failed));
        }
        let mut next = self.next(now);
        next.status = JobStatus::Failed;
        next.last_error = Some(cause);
        next.pause_requested = false;
        next.finished_at = Some(now);
        Ok(next)
    }

    /// `Running -> Paused`, acknowledging a pause request. Pending jobs may
    /// also be parked before their first batch.
    pub fn pause(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Running | JobStatus::Pending => {
                let mut next = self.next(now);
                next.status = JobStatus::Paused;
                next.pause_requested = false;
                next.execution_id = None;
                Ok(next)
            }
            _ => Err(self.illegal(JobStatus::Paused)),
        }
    }

    /// Raise the operator pause signal.
    pub fn request_pause(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        match self.status {
            JobStatus::Running | JobStatus::Pending => {
                let mut next = self.next(now);
                next.pause_requested = true;
                Ok(next)
            }
            _ => Err(self.illegal(JobStatus::Paused)),
        }
    }

    /// Clear a pause signal that has not been acted on yet.
    pub fn clear_pause_request(&self, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.is_terminal() {
            return Err(self.illegal(JobStatus::Running));
        }
        let mut next = self.next(now);
        next.pause_requested = false;
        Ok(next)
    }

    /// Bind a pending job to the execution unit about to run it.
    pub fn assign(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.is_terminal() {
            return Err(self.illegal(JobStatus::Running));
        }
        let mut next = self.next(now);
        next.execution_id = Some(execution_id);
        next.heartbeat_at = Some(now);
        Ok(next)
    }

    /// Drop the assignment of `execution_id` after its unit failed to launch.
    pub fn release(&self, execution_id: Uuid, now: DateTime<Utc>) -> Result<JobState, ReindexError> {
        if self.is_terminal() || !self.is_owned_by(execution_id) {
            return Err(self.illegal(self.status));
        }
        let mut next = self.next(now);
        next.execution_id = None;
        Ok(next)
    }

    /// No liveness signal within `timeout` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        let last_seen = self.heartbeat_at.unwrap_or(self.updated_at);
        now - last_seen > timeout
    }
}

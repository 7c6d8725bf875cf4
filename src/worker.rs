//! # Reindex Worker
//!
//! Drives one job through its state machine inside an execution unit:
//!
//! ```text
//! Pending --start--> Running --batch, more--> Running
//!                    Running --batch, exhausted--> Completed
//!                    Running --transient, retries left--> Running (after backoff)
//!                    Running --transient, retries exhausted--> Failed
//!                    Running --fatal / invalid cursor--> Failed
//!                    Running --pause requested--> Paused --resume--> Running
//! ```
//!
//! The batch loop is strictly sequential and every transition is persisted
//! through compare-and-set before the next batch starts. A worker that loses a
//! compare-and-set to anything other than an operator signal has lost write
//! authority and stops without touching the job again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::copier::{BatchCopier, BatchResult};
use crate::error::ReindexError;
use crate::models::job_state::{FailureCause, FailureKind, JobState};
use crate::registry::JobRegistry;

/// Re-reads tolerated per transition when operators touch the job concurrently.
const MAX_COMMIT_ATTEMPTS: usize = 8;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct RunStats {
    docs_read: u64,
    docs_written: u64,
    batches: u64,
    retries: u64,
}

/// Runs reindex jobs against a registry with a batch copier.
#[derive(Clone)]
pub struct ReindexWorker {
    registry: Arc<dyn JobRegistry>,
    copier: BatchCopier,
    heartbeat_interval: Duration,
}

impl ReindexWorker {
    pub fn new(registry: Arc<dyn JobRegistry>, copier: BatchCopier) -> Self {
        Self {
            registry,
            copier,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// How often a batch still in flight refreshes the job's heartbeat.
    /// Keep this well below the dispatcher's liveness timeout.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Run `job_id` as execution `execution_id` until it completes, fails,
    /// pauses or `cancel` fires. Returns the last persisted state.
    ///
    /// Errors mean the worker stopped without recording a terminal state:
    /// the job was already terminal, another execution owns it, or the
    /// registry was unreachable.
    #[instrument(skip(self, cancel), fields(job_id = %job_id, execution_id = %execution_id))]
    pub async fn run(
        &self,
        job_id: Uuid,
        execution_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<JobState, ReindexError> {
        let started = Instant::now();
        let mut stats = RunStats::default();

        let mut state = self.claim(job_id, execution_id).await?;
        let spec = state.spec.clone();

        info!(
            source = %spec.source,
            target = %spec.target,
            cursor = %state.cursor,
            docs_copied = state.docs_copied,
            "Reindex job running"
        );

        loop {
            if cancel.is_cancelled() {
                warn!("Cancellation observed between batches");
                state = self
                    .commit(&state, execution_id, |s| {
                        s.fail(
                            FailureCause::new(FailureKind::Cancelled, "cancelled by operator"),
                            Utc::now(),
                        )
                    })
                    .await?;
                break;
            }

            if state.pause_requested {
                state = self
                    .commit(&state, execution_id, |s| s.pause(Utc::now()))
                    .await?;
                info!(cursor = %state.cursor, "Reindex job paused");
                break;
            }

            let batch_started = Instant::now();
            let cursor = state.cursor.clone();
            let outcome = {
                let copy = self.copier.copy_batch(&spec, &cursor, spec.batch_size);
                tokio::pin!(copy);
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + self.heartbeat_interval,
                    self.heartbeat_interval,
                );
                loop {
                    tokio::select! {
                        result = &mut copy => break result,
                        _ = ticker.tick() => {
                            state = self
                                .commit(&state, execution_id, |s| s.heartbeat(Utc::now()))
                                .await?;
                            debug!("Heartbeat while batch in flight");
                        }
                    }
                }
            };

            match outcome {
                Ok(batch) => {
                    histogram!("reindex_batch_duration_seconds")
                        .record(batch_started.elapsed().as_secs_f64());
                    stats.docs_read += batch.docs_read as u64;
                    stats.docs_written += batch.docs_written as u64;

                    if batch.docs_read > 0 {
                        state = self.record_batch(&state, execution_id, &batch).await?;
                        stats.batches += 1;
                    }

                    if batch.exhausted {
                        state = self
                            .commit(&state, execution_id, |s| s.complete(Utc::now()))
                            .await?;
                        break;
                    }
                }
                Err(err) if err.is_retryable() => {
                    stats.retries += 1;
                    counter!("reindex_batch_retries_total").increment(1);
                    state = self
                        .commit(&state, execution_id, |s| s.record_retry(Utc::now()))
                        .await?;

                    if state.retry_count >= spec.retry.max_retries {
                        error!(
                            retry_count = state.retry_count,
                            error = %err,
                            "Retries exhausted"
                        );
                        state = self.fail(&state, execution_id, &err).await?;
                        break;
                    }

                    let delay = spec.retry.backoff_for_attempt(state.retry_count);
                    warn!(
                        retry_count = state.retry_count,
                        max_retries = spec.retry.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient copy failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err @ (ReindexError::AuthorityLost(_) | ReindexError::Storage(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, cursor = %state.cursor, "Batch failed permanently");
                    state = self.fail(&state, execution_id, &err).await?;
                    break;
                }
            }
        }

        counter!("reindex_jobs_finished_total", "status" => state.status.as_str()).increment(1);
        info!(
            status = %state.status,
            docs_read = stats.docs_read,
            docs_written = stats.docs_written,
            batches = stats.batches,
            retries = stats.retries,
            docs_copied_total = state.docs_copied,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reindex execution finished"
        );

        Ok(state)
    }

    /// Take write authority. The dispatcher assigns the execution id before
    /// launching the unit; a job assigned to another execution is not ours.
    async fn claim(&self, job_id: Uuid, execution_id: Uuid) -> Result<JobState, ReindexError> {
        let current = self.registry.get(job_id).await?;
        let claimed = current.claim(execution_id, Utc::now())?;

        if let Some(owner) = current.execution_id
            && owner != execution_id
        {
            warn!(owner = %owner, "Job is owned by another execution");
            return Err(ReindexError::AuthorityLost(job_id));
        }

        if !self
            .registry
            .compare_and_set(job_id, &current, claimed.clone())
            .await?
        {
            return Err(ReindexError::AuthorityLost(job_id));
        }

        debug!(from = %current.status, "Claimed job");
        Ok(claimed)
    }

    async fn record_batch(
        &self,
        state: &JobState,
        execution_id: Uuid,
        batch: &BatchResult,
    ) -> Result<JobState, ReindexError> {
        let next = self
            .commit(state, execution_id, |s| s.record_batch(batch, Utc::now()))
            .await?;
        counter!("reindex_batches_total").increment(1);
        counter!("reindex_documents_copied_total").increment(batch.docs_written as u64);
        debug!(
            docs = batch.docs_written,
            docs_copied = next.docs_copied,
            batches_completed = next.batches_completed,
            "Batch committed"
        );
        Ok(next)
    }

    async fn fail(
        &self,
        state: &JobState,
        execution_id: Uuid,
        err: &ReindexError,
    ) -> Result<JobState, ReindexError> {
        let cause = FailureCause::from_error(err);
        self.commit(state, execution_id, |s| s.fail(cause.clone(), Utc::now()))
            .await
    }

    /// Persist `transition(state)`. When the CAS loses, re-read: if this
    /// execution still owns the job in the same status the change was an
    /// operator signal (pause request) and the transition is re-applied on
    /// the fresh snapshot; anything else means authority was lost.
    async fn commit<F>(
        &self,
        state: &JobState,
        execution_id: Uuid,
        transition: F,
    ) -> Result<JobState, ReindexError>
    where
        F: Fn(&JobState) -> Result<JobState, ReindexError>,
    {
        let job_id = state.id;
        let mut current = state.clone();

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let next = transition(&current)?;
            if self
                .registry
                .compare_and_set(job_id, &current, next.clone())
                .await?
            {
                return Ok(next);
            }

            let fresh = self.registry.get(job_id).await?;
            if !fresh.is_owned_by(execution_id) || fresh.status != current.status {
                warn!(
                    stored_status = %fresh.status,
                    stored_version = fresh.version,
                    "Lost write authority over job"
                );
                counter!("reindex_authority_lost_total").increment(1);
                return Err(ReindexError::AuthorityLost(job_id));
            }
            current = fresh;
        }

        Err(ReindexError::AuthorityLost(job_id))
    }
}

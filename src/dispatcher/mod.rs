//! # Execution Dispatcher
//!
//! Maps reindex jobs onto isolated execution units and watches them. How a
//! unit actually runs is the business of an [`ExecutionBackend`]: an
//! in-process task ([`local::LocalExecutionBackend`]) or a child worker
//! process ([`process::ProcessExecutionBackend`]). Any other substrate, such
//! as a container orchestrator, fits the same four calls.
//!
//! At most one live unit may hold a job. The dispatcher refuses a second
//! submission while the first unit is alive, and write authority is fenced in
//! the registry by the job's `execution_id`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ReindexError;
use crate::models::job_spec::ReindexJobSpec;
use crate::models::job_state::{FailureCause, FailureKind, JobState, JobStatus};
use crate::registry::{JobRegistry, update_job};

pub mod local;
pub mod process;

pub use local::LocalExecutionBackend;
pub use process::ProcessExecutionBackend;

/// Reference to one launched execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionHandle {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    /// Human-readable unit name, `reindex-<yyyyMMddHHmmss>-<5 hex>`
    pub name: String,
}

impl ExecutionHandle {
    pub fn new(job_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            execution_id: Uuid::new_v4(),
            name: execution_name(now),
        }
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (job {})", self.name, self.job_id)
    }
}

/// Observed state of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Capability to create, watch and delete execution units.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start a unit that runs the worker for `handle.job_id` as `handle.execution_id`.
    async fn launch(&self, handle: &ExecutionHandle) -> Result<(), ReindexError>;

    /// Current state of the unit. Units this backend does not know are `Failed`.
    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ReindexError>;

    /// Ask the unit to stop. Advisory: the unit may take time to observe it.
    async fn terminate(&self, handle: &ExecutionHandle) -> Result<(), ReindexError>;

    /// Drop what the backend keeps for a finished unit. Returns `false` and
    /// keeps the record while the unit is still running.
    async fn release(&self, handle: &ExecutionHandle) -> Result<bool, ReindexError>;
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// A unit without a heartbeat for this long is considered lost
    pub liveness_timeout: Duration,
    /// Poll interval used by [`ExecutionDispatcher::wait`]
    pub poll_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Result of one reconcile pass over the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub examined: u64,
    pub marked_lost: u64,
    pub cleaned_up: u64,
}

pub struct ExecutionDispatcher {
    registry: Arc<dyn JobRegistry>,
    backend: Arc<dyn ExecutionBackend>,
    settings: DispatcherSettings,
    live: Mutex<HashMap<Uuid, ExecutionHandle>>,
    cancelled: Mutex<HashMap<Uuid, Uuid>>,
}

impl ExecutionDispatcher {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        backend: Arc<dyn ExecutionBackend>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            registry,
            backend,
            settings,
            live: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Create a job for `spec` and launch its first execution unit.
    pub async fn submit(&self, spec: ReindexJobSpec) -> Result<ExecutionHandle, ReindexError> {
        let job_id = self.registry.create(spec).await?;
        self.dispatch(job_id).await
    }

    /// Launch an execution unit for an existing job. Fails with
    /// `DuplicateJob` while another unit for the job is alive.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn dispatch(&self, job_id: Uuid) -> Result<ExecutionHandle, ReindexError> {
        let existing = self.live.lock().await.get(&job_id).cloned();

        let mut exited = None;
        if let Some(existing) = existing {
            if !self.backend.status(&existing).await?.is_finished() {
                warn!(execution = %existing.name, "Rejected duplicate submission");
                counter!("reindex_duplicate_submissions_total").increment(1);
                return Err(ReindexError::DuplicateJob { job_id });
            }
            exited = Some(existing.execution_id);
            self.forget(&existing).await;
        }

        let handle = ExecutionHandle::new(job_id, Utc::now());
        let execution_id = handle.execution_id;
        let timeout = self.liveness_timeout();

        // Fence the job to the new execution before anything runs. Concurrent
        // dispatches of one job race here and all but one see `DuplicateJob`.
        update_job(self.registry.as_ref(), job_id, |state| {
            let now = Utc::now();
            if state.is_terminal() {
                return Err(ReindexError::IllegalTransition {
                    job_id,
                    from: state.status.to_string(),
                    to: JobStatus::Running.to_string(),
                });
            }
            // An assignment is only free once its unit has exited or gone quiet.
            if state.execution_id.is_some()
                && state.execution_id != exited
                && !state.is_stale(now, timeout)
            {
                return Err(ReindexError::DuplicateJob { job_id });
            }
            state.assign(execution_id, now)
        })
        .await?;

        if let Err(err) = self.backend.launch(&handle).await {
            error!(execution = %handle.name, error = %err, "Failed to launch execution unit");
            let released = update_job(self.registry.as_ref(), job_id, |state| {
                state.release(execution_id, Utc::now())
            })
            .await;
            if let Err(release_err) = released {
                warn!(error = %release_err, "Could not release job after failed launch");
            }
            return Err(err);
        }

        counter!("reindex_executions_launched_total").increment(1);
        info!(execution = %handle.name, execution_id = %execution_id, "Execution unit launched");
        self.live.lock().await.insert(job_id, handle.clone());
        Ok(handle)
    }

    pub async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ReindexError> {
        self.backend.status(handle).await
    }

    /// Request termination of a unit. The job is marked `Failed{cancelled}`
    /// by the worker when it observes the request, or by the next reconcile
    /// if the unit dies first.
    pub async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), ReindexError> {
        self.cancelled
            .lock()
            .await
            .insert(handle.job_id, handle.execution_id);
        self.backend.terminate(handle).await?;
        info!(job_id = %handle.job_id, execution = %handle.name, "Cancellation requested");
        Ok(())
    }

    /// Cancel a job by id. The registry records `Failed{cancelled}` first, so
    /// a unit launched by another process loses write authority at its next
    /// commit; a unit launched by this dispatcher is also terminated.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        let failed = update_job(self.registry.as_ref(), job_id, |state| {
            state.fail(
                FailureCause::new(FailureKind::Cancelled, "cancelled by operator"),
                Utc::now(),
            )
        })
        .await?;

        if let Some(handle) = self.handle_for(job_id).await
            && let Err(err) = self.cancel(&handle).await
        {
            warn!(execution = %handle.name, error = %err, "Could not terminate cancelled unit");
        }

        counter!("reindex_jobs_cancelled_total").increment(1);
        info!(cursor = %failed.cursor, "Job cancelled");
        Ok(failed)
    }

    /// Handle of the unit this dispatcher launched for `job_id`, if any.
    pub async fn handle_for(&self, job_id: Uuid) -> Option<ExecutionHandle> {
        self.live.lock().await.get(&job_id).cloned()
    }

    /// Raise the pause signal for a job.
    pub async fn pause(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        self.registry.request_pause(job_id).await
    }

    /// Undo a pause. A parked job gets a new execution unit; a job whose pause
    /// request has not been acted on yet just has the request cleared.
    pub async fn resume(&self, job_id: Uuid) -> Result<Option<ExecutionHandle>, ReindexError> {
        let state = self.registry.get(job_id).await?;
        match state.status {
            JobStatus::Paused => self.dispatch(job_id).await.map(Some),
            JobStatus::Pending | JobStatus::Running => {
                update_job(self.registry.as_ref(), job_id, |s| {
                    s.clear_pause_request(Utc::now())
                })
                .await?;
                Ok(None)
            }
            JobStatus::Failed | JobStatus::Completed => Err(ReindexError::IllegalTransition {
                job_id,
                from: state.status.to_string(),
                to: JobStatus::Running.to_string(),
            }),
        }
    }

    /// Poll a unit until it finishes.
    pub async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ReindexError> {
        loop {
            let status = self.backend.status(handle).await?;
            if status.is_finished() {
                return Ok(status);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Bring the registry in line with what the execution unit actually did.
    /// A job still claimed by a unit that exited, or whose heartbeat is older
    /// than the liveness timeout, is marked `Failed` with a lost-worker cause.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reconcile(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        let state = self.registry.get(job_id).await?;
        let now = Utc::now();

        let handle = self.live.lock().await.get(&job_id).cloned();

        if state.is_terminal() || state.status == JobStatus::Paused {
            if let Some(handle) = handle
                && self.backend.status(&handle).await?.is_finished()
            {
                self.forget(&handle).await;
            }
            return Ok(state);
        }

        let Some(execution_id) = state.execution_id else {
            return Ok(state);
        };

        let tracked = handle.filter(|h| h.execution_id == execution_id);
        let mut exited = false;
        let reason = match &tracked {
            Some(handle) => match self.backend.status(handle).await? {
                ExecutionStatus::Running if state.is_stale(now, self.liveness_timeout()) => {
                    self.backend.terminate(handle).await?;
                    Some("no heartbeat within the liveness timeout".to_string())
                }
                ExecutionStatus::Running => None,
                finished => {
                    exited = true;
                    Some(format!(
                        "execution unit {} exited ({:?}) without recording a terminal state",
                        handle.name, finished
                    ))
                }
            },
            None if state.is_stale(now, self.liveness_timeout()) => {
                Some("no heartbeat within the liveness timeout".to_string())
            }
            None => None,
        };

        let Some(reason) = reason else {
            return Ok(state);
        };

        let was_cancelled = self.cancelled.lock().await.get(&job_id) == Some(&execution_id);
        let cause = if was_cancelled {
            FailureCause::new(FailureKind::Cancelled, "execution unit terminated on request")
        } else {
            FailureCause::from_error(&ReindexError::LostWorker {
                job_id,
                reason: reason.clone(),
            })
        };

        let failed = state.fail(cause, now)?;
        if !self
            .registry
            .compare_and_set(job_id, &state, failed.clone())
            .await?
        {
            debug!("Job changed during reconcile, leaving it for the next pass");
            return self.registry.get(job_id).await;
        }

        if was_cancelled {
            info!("Cancelled job marked failed");
        } else {
            counter!("reindex_lost_workers_total").increment(1);
            warn!(reason = %reason, cursor = %failed.cursor, "Lost worker, job marked failed");
        }

        // A terminated unit stays tracked until it exits; the sweep in
        // `reconcile_all` releases it then.
        if let Some(handle) = tracked
            && exited
        {
            self.forget(&handle).await;
        }
        Ok(failed)
    }

    /// Reconcile every job that holds an execution assignment, then release
    /// every unit of this dispatcher that has exited.
    pub async fn reconcile_all(&self) -> Result<ReconcileStats, ReindexError> {
        let mut stats = ReconcileStats::default();

        for job in self.registry.list_assigned().await? {
            stats.examined += 1;
            match self.reconcile(job.id).await {
                Ok(state) if state.status == JobStatus::Failed => stats.marked_lost += 1,
                Ok(_) => {}
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "Failed to reconcile job");
                }
            }
        }

        let tracked: Vec<ExecutionHandle> = self.live.lock().await.values().cloned().collect();
        for handle in tracked {
            if self.backend.status(&handle).await?.is_finished() {
                self.forget(&handle).await;
                stats.cleaned_up += 1;
            }
        }

        Ok(stats)
    }

    /// Run [`reconcile_all`](Self::reconcile_all) every `interval` until
    /// `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting execution reconciler");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Execution reconciler shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match self.reconcile_all().await {
                        Ok(stats) => debug!(
                            examined = stats.examined,
                            marked_lost = stats.marked_lost,
                            cleaned_up = stats.cleaned_up,
                            "Reconcile pass finished"
                        ),
                        Err(err) => error!(error = %err, "Reconcile pass failed"),
                    }
                }
            }
        }

        info!("Execution reconciler stopped");
    }

    /// Stop tracking an exited unit here and in the backend.
    async fn forget(&self, handle: &ExecutionHandle) {
        let mut live = self.live.lock().await;
        if live
            .get(&handle.job_id)
            .is_some_and(|h| h.execution_id == handle.execution_id)
        {
            live.remove(&handle.job_id);
        }
        drop(live);

        let mut cancelled = self.cancelled.lock().await;
        if cancelled.get(&handle.job_id) == Some(&handle.execution_id) {
            cancelled.remove(&handle.job_id);
        }
        drop(cancelled);

        match self.backend.release(handle).await {
            Ok(true) => debug!(execution = %handle.name, "Execution unit released"),
            Ok(false) => {}
            Err(err) => warn!(execution = %handle.name, error = %err, "Could not release execution unit"),
        }
    }
}

/// `reindex-<yyyyMMddHHmmss>-<5 hex>`
pub fn execution_name(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x10_0000);
    format!("reindex-{}-{:05x}", now.format("%Y%m%d%H%M%S"), suffix)
}

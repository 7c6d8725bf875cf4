//! In-process execution units: each job runs as a tokio task with its own
//! cancellation token.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::{ExecutionBackend, ExecutionHandle, ExecutionStatus};
use crate::error::ReindexError;
use crate::models::job_state::JobStatus;
use crate::worker::ReindexWorker;

struct LocalUnit {
    cancel: CancellationToken,
    status: watch::Receiver<ExecutionStatus>,
}

pub struct LocalExecutionBackend {
    worker: ReindexWorker,
    units: Mutex<HashMap<Uuid, LocalUnit>>,
}

impl LocalExecutionBackend {
    pub fn new(worker: ReindexWorker) -> Self {
        Self {
            worker,
            units: Mutex::new(HashMap::new()),
        }
    }

    /// Units launched and not yet released.
    pub async fn tracked_units(&self) -> usize {
        self.units.lock().await.len()
    }
}

#[async_trait]
impl ExecutionBackend for LocalExecutionBackend {
    async fn launch(&self, handle: &ExecutionHandle) -> Result<(), ReindexError> {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);

        let worker = self.worker.clone();
        let token = cancel.clone();
        let job_id = handle.job_id;
        let execution_id = handle.execution_id;
        let name = handle.name.clone();

        tokio::spawn(async move {
            let outcome = match worker.run(job_id, execution_id, token).await {
                Ok(state) if matches!(state.status, JobStatus::Completed | JobStatus::Paused) => {
                    ExecutionStatus::Succeeded
                }
                Ok(_) => ExecutionStatus::Failed,
                Err(err) => {
                    error!(execution = %name, error = %err, "Execution unit stopped with error");
                    ExecutionStatus::Failed
                }
            };
            debug!(execution = %name, status = ?outcome, "Execution unit exited");
            let _ = status_tx.send(outcome);
        });

        self.units.lock().await.insert(
            execution_id,
            LocalUnit {
                cancel,
                status: status_rx,
            },
        );
        Ok(())
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ReindexError> {
        Ok(self
            .units
            .lock()
            .await
            .get(&handle.execution_id)
            .map(|unit| *unit.status.borrow())
            .unwrap_or(ExecutionStatus::Failed))
    }

    async fn terminate(&self, handle: &ExecutionHandle) -> Result<(), ReindexError> {
        match self.units.lock().await.get(&handle.execution_id) {
            Some(unit) => {
                unit.cancel.cancel();
                Ok(())
            }
            None => Err(ReindexError::Execution(format!(
                "unknown execution unit {}",
                handle.name
            ))),
        }
    }

    async fn release(&self, handle: &ExecutionHandle) -> Result<bool, ReindexError> {
        let mut units = self.units.lock().await;
        let finished = units
            .get(&handle.execution_id)
            .is_some_and(|unit| unit.status.borrow().is_finished());
        if finished {
            units.remove(&handle.execution_id);
        }
        Ok(finished)
    }
}

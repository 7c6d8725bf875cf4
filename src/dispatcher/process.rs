//! Child-process execution units: each job runs as `<binary> worker --job-id
//! <id> --execution-id <id>`, inheriting this process's environment and
//! therefore its `REINDEX_*` configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ExecutionBackend, ExecutionHandle, ExecutionStatus};
use crate::error::ReindexError;

pub struct ProcessExecutionBackend {
    program: PathBuf,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl ProcessExecutionBackend {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Child processes launched and not yet reaped.
    pub async fn tracked_units(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Launch workers with the currently running binary.
    pub fn current_exe() -> Result<Self, ReindexError> {
        let program = std::env::current_exe().map_err(|err| {
            ReindexError::Execution(format!("cannot locate worker binary: {}", err))
        })?;
        Ok(Self::new(program))
    }

    fn command(&self, handle: &ExecutionHandle) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--job-id")
            .arg(handle.job_id.to_string())
            .arg("--execution-id")
            .arg(handle.execution_id.to_string())
            .env("REINDEX_EXECUTION_NAME", &handle.name)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        command
    }
}

#[async_trait]
impl ExecutionBackend for ProcessExecutionBackend {
    async fn launch(&self, handle: &ExecutionHandle) -> Result<(), ReindexError> {
        let child = self.command(handle).spawn().map_err(|err| {
            ReindexError::Execution(format!(
                "failed to spawn {} for {}: {}",
                self.program.display(),
                handle.name,
                err
            ))
        })?;

        info!(
            execution = %handle.name,
            pid = child.id().unwrap_or_default(),
            "Worker process spawned"
        );
        self.children.lock().await.insert(handle.execution_id, child);
        Ok(())
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ReindexError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.execution_id) else {
            return Ok(ExecutionStatus::Failed);
        };

        match child.try_wait() {
            Ok(None) => Ok(ExecutionStatus::Running),
            Ok(Some(exit)) if exit.success() => Ok(ExecutionStatus::Succeeded),
            Ok(Some(exit)) => {
                warn!(execution = %handle.name, exit = %exit, "Worker process failed");
                Ok(ExecutionStatus::Failed)
            }
            Err(err) => Err(ReindexError::Execution(format!(
                "cannot poll {}: {}",
                handle.name, err
            ))),
        }
    }

    async fn terminate(&self, handle: &ExecutionHandle) -> Result<(), ReindexError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.execution_id) else {
            return Err(ReindexError::Execution(format!(
                "unknown execution unit {}",
                handle.name
            )));
        };

        child.start_kill().map_err(|err| {
            ReindexError::Execution(format!("cannot terminate {}: {}", handle.name, err))
        })
    }

    async fn release(&self, handle: &ExecutionHandle) -> Result<bool, ReindexError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.execution_id) else {
            return Ok(false);
        };

        match child.try_wait() {
            Ok(Some(_)) => {
                children.remove(&handle.execution_id);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(ReindexError::Execution(format!(
                "cannot poll {}: {}",
                handle.name, err
            ))),
        }
    }
}

//! In-process job registry, for single-process deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::JobRegistry;
use crate::error::ReindexError;
use crate::models::job_state::{JobState, JobStatus};

#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<Uuid, JobState>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn insert(&self, state: JobState) -> Result<Uuid, ReindexError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&state.id) {
            return Err(ReindexError::Storage(format!(
                "job {} already exists",
                state.id
            )));
        }
        let job_id = state.id;
        jobs.insert(job_id, state);
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(ReindexError::JobNotFound(job_id))
    }

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: &JobState,
        mut new: JobState,
    ) -> Result<bool, ReindexError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job_id)
            .ok_or(ReindexError::JobNotFound(job_id))?;

        if stored.version != expected.version || stored.status != expected.status {
            return Ok(false);
        }

        new.id = job_id;
        new.version = expected.version + 1;
        *stored = new;
        Ok(true)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<JobState>, ReindexError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<JobState> = jobs
            .values()
            .filter(|job| status.is_none_or(|status| job.status == status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_assigned(&self) -> Result<Vec<JobState>, ReindexError> {
        let jobs = self.jobs.read().await;
        let mut assigned: Vec<JobState> = jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
            .filter(|job| job.execution_id.is_some())
            .cloned()
            .collect();
        assigned.sort_by(|a, b| {
            a.heartbeat_at
                .cmp(&b.heartbeat_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(assigned)
    }
}

//! Job registry backed by the `reindex_jobs` table.
//!
//! Compare-and-set is a single conditional `UPDATE ... WHERE id = ? AND
//! version = ? AND status = ?`; exactly one affected row means the write won.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use super::JobRegistry;
use crate::error::ReindexError;
use crate::models::job_state::{JobState, JobStatus};
use crate::models::reindex_job::{self, Column, Entity};

/// Registry over a sea-orm connection (Postgres in production, SQLite in tests).
#[derive(Debug, Clone)]
pub struct DatabaseJobRegistry {
    db: DatabaseConnection,
}

impl DatabaseJobRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobRegistry for DatabaseJobRegistry {
    async fn insert(&self, state: JobState) -> Result<Uuid, ReindexError> {
        let job_id = state.id;
        reindex_job::active_model(&state)?
            .insert(&self.db)
            .await
            .map_err(|e| {
                tracing::error!(job_id = %job_id, "Failed to insert reindex job: {}", e);
                ReindexError::Storage(format!("failed to insert job {}: {}", job_id, e))
            })?;
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<JobState, ReindexError> {
        let model = Entity::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or(ReindexError::JobNotFound(job_id))?;
        JobState::try_from(model)
    }

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: &JobState,
        new: JobState,
    ) -> Result<bool, ReindexError> {
        let mut model = reindex_job::active_model(&new)?;
        model.id = Set(job_id);
        model.version = Set(expected.version + 1);

        let result = Entity::update_many()
            .set(model)
            .filter(Column::Id.eq(job_id))
            .filter(Column::Version.eq(expected.version))
            .filter(Column::Status.eq(expected.status.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            return Ok(true);
        }

        // Distinguish a lost race from a job that does not exist.
        let exists = Entity::find_by_id(job_id).one(&self.db).await?.is_some();
        if !exists {
            return Err(ReindexError::JobNotFound(job_id));
        }
        tracing::debug!(
            job_id = %job_id,
            expected_version = expected.version,
            "Compare-and-set lost to a concurrent writer"
        );
        Ok(false)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<JobState>, ReindexError> {
        let mut query = Entity::find().order_by_desc(Column::CreatedAt);

        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        query
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(JobState::try_from)
            .collect()
    }

    async fn list_assigned(&self) -> Result<Vec<JobState>, ReindexError> {
        Entity::find()
            .filter(Column::Status.is_in([JobStatus::Pending.as_str(), JobStatus::Running.as_str()]))
            .filter(Column::ExecutionId.is_not_null())
            .order_by_asc(Column::HeartbeatAt)
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(JobState::try_from)
            .collect()
    }
}

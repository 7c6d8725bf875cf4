//! ReindexJob entity model
//!
//! SeaORM entity for the `reindex_jobs` table, the durable form of
//! [`JobState`]. Conversions in both directions live here so the registry
//! only deals in `JobState`.

use chrono::Utc;
use sea_orm::ActiveModelBehavior;
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::ReindexError;
use crate::models::job_state::{FailureCause, JobState, JobStatus};

/// One reindex job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "reindex_jobs")]
pub struct Model {
    /// Job identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// pending, running, paused, failed or completed
    pub status: String,

    /// Immutable job specification
    #[sea_orm(column_type = "JsonBinary")]
    pub spec: JsonValue,

    /// Last acknowledged cursor token
    #[sea_orm(column_type = "Text")]
    pub cursor: String,

    pub docs_copied: i64,

    pub batches_completed: i64,

    /// Consecutive transient failures of the current batch
    pub retry_count: i32,

    /// Failure cause, set only for failed jobs
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_error: Option<JsonValue>,

    pub pause_requested: bool,

    /// Execution unit holding write authority
    pub execution_id: Option<Uuid>,

    /// Failed job this job continues
    pub resumed_from: Option<Uuid>,

    /// Compare-and-set fencing token
    pub version: i64,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Last liveness signal from the execution unit
    pub heartbeat_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for JobState {
    type Error = ReindexError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let spec = serde_json::from_value(model.spec).map_err(|err| {
            ReindexError::Storage(format!("job {} has an unreadable spec: {}", model.id, err))
        })?;

        let last_error = model
            .last_error
            .map(serde_json::from_value::<FailureCause>)
            .transpose()
            .map_err(|err| {
                ReindexError::Storage(format!(
                    "job {} has an unreadable last_error: {}",
                    model.id, err
                ))
            })?;

        Ok(JobState {
            id: model.id,
            spec,
            status: model.status.parse::<JobStatus>()?,
            cursor: Cursor::from_token(model.cursor),
            docs_copied: model.docs_copied.max(0) as u64,
            batches_completed: model.batches_completed.max(0) as u64,
            retry_count: model.retry_count.max(0) as u32,
            last_error,
            pause_requested: model.pause_requested,
            execution_id: model.execution_id,
            resumed_from: model.resumed_from,
            version: model.version,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
            started_at: model.started_at.map(|at| at.with_timezone(&Utc)),
            finished_at: model.finished_at.map(|at| at.with_timezone(&Utc)),
            heartbeat_at: model.heartbeat_at.map(|at| at.with_timezone(&Utc)),
        })
    }
}

/// Full active model for a state, every column set.
pub fn active_model(state: &JobState) -> Result<ActiveModel, ReindexError> {
    let spec = serde_json::to_value(&state.spec)
        .map_err(|err| ReindexError::Storage(format!("cannot serialize job spec: {}", err)))?;
    let last_error = state
        .last_error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| ReindexError::Storage(format!("cannot serialize failure cause: {}", err)))?;

    Ok(ActiveModel {
        id: Set(state.id),
        status: Set(state.status.as_str().to_string()),
        spec: Set(spec),
        cursor: Set(state.cursor.as_str().to_string()),
        docs_copied: Set(state.docs_copied as i64),
        batches_completed: Set(state.batches_completed as i64),
        retry_count: Set(state.retry_count as i32),
        last_error: Set(last_error),
        pause_requested: Set(state.pause_requested),
        execution_id: Set(state.execution_id),
        resumed_from: Set(state.resumed_from),
        version: Set(state.version),
        created_at: Set(state.created_at.into()),
        updated_at: Set(state.updated_at.into()),
        started_at: Set(state.started_at.map(Into::into)),
        finished_at: Set(state.finished_at.map(Into::into)),
        heartbeat_at: Set(state.heartbeat_at.map(Into::into)),
    })
}

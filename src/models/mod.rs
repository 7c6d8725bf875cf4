//! # Data Models
//!
//! Job specification, job state and the persisted `reindex_jobs` entity.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod job_spec;
pub mod job_state;
pub mod reindex_job;

pub use job_spec::{
    ClusterConfig, CollectionRef, FieldSelection, FieldTransform, ReindexFilters, ReindexJobSpec,
    RetryPolicy,
};
pub use job_state::{FailureCause, FailureKind, JobState, JobStatus};
pub use reindex_job::Entity as ReindexJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "solrex-reindex".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

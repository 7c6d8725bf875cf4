//! Database migrations for the reindex job registry.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_06_02_090000_create_reindex_jobs;
mod m2025_06_09_120000_add_reindex_job_status_index;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_02_090000_create_reindex_jobs::Migration),
            Box::new(m2025_06_09_120000_add_reindex_job_status_index::Migration),
        ]
    }
}

//! Adds the index used by status listings and the dispatcher's reconcile sweep.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_reindex_jobs_status_created")
                    .table(ReindexJobs::Table)
                    .col(ReindexJobs::Status)
                    .col(ReindexJobs::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_reindex_jobs_status_created")
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ReindexJobs {
    Table,
    Status,
    CreatedAt,
}

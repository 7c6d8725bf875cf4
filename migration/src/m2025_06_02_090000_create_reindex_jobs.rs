//! Migration to create the reindex_jobs table.
//!
//! Each row is the durable JobState of one reindex job: the immutable spec, the
//! last acknowledged cursor, progress counters and the fencing version used for
//! compare-and-set transitions.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReindexJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReindexJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(ReindexJobs::Spec).json_binary().not_null())
                    .col(ColumnDef::new(ReindexJobs::Cursor).text().not_null())
                    .col(
                        ColumnDef::new(ReindexJobs::DocsCopied)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::BatchesCompleted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ReindexJobs::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(ReindexJobs::PauseRequested)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ReindexJobs::ExecutionId).uuid().null())
                    .col(ColumnDef::new(ReindexJobs::ResumedFrom).uuid().null())
                    .col(
                        ColumnDef::new(ReindexJobs::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReindexJobs::HeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ReindexJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ReindexJobs {
    Table,
    Id,
    Status,
    Spec,
    Cursor,
    DocsCopied,
    BatchesCompleted,
    RetryCount,
    LastError,
    PauseRequested,
    ExecutionId,
    ResumedFrom,
    Version,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    FinishedAt,
    HeartbeatAt,
}

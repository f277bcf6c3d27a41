//! Migration to create the job_items table.
//!
//! One row per parent object to mutate. Rows start `pending` and move to a
//! single terminal status; resume reads the `(job_id, status)` index.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobItems::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobItems::JobId).integer().not_null())
                    .col(ColumnDef::new(JobItems::AccountId).string().not_null())
                    .col(ColumnDef::new(JobItems::ParentId).string().null())
                    .col(ColumnDef::new(JobItems::ParentName).text().null())
                    .col(ColumnDef::new(JobItems::CampaignId).string().null())
                    .col(ColumnDef::new(JobItems::CampaignName).text().null())
                    .col(ColumnDef::new(JobItems::Variant).string().not_null())
                    .col(
                        ColumnDef::new(JobItems::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(JobItems::ChildRef).string().null())
                    .col(ColumnDef::new(JobItems::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(JobItems::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_items_job_id")
                            .from(JobItems::Table, JobItems::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_items_job_status")
                    .table(JobItems::Table)
                    .col(JobItems::JobId)
                    .col(JobItems::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_items_job_account")
                    .table(JobItems::Table)
                    .col(JobItems::JobId)
                    .col(JobItems::AccountId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_job_items_job_status").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_job_items_job_account").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobItems {
    Table,
    Id,
    JobId,
    AccountId,
    ParentId,
    ParentName,
    CampaignId,
    CampaignName,
    Variant,
    Status,
    ChildRef,
    ErrorMessage,
    ProcessedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}

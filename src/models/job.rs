//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table. A job
//! owns a fixed set of items and carries their aggregate counters.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use super::{JobSource, JobStatus};

/// Job entity representing one batch of mutation work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Auto-incrementing identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Normalised variant key applied to every item (e.g. `black_friday`)
    pub variant: String,

    /// Number of items created with the job
    pub total_items: i32,

    pub successful_items: i32,

    pub failed_items: i32,

    pub skipped_items: i32,

    /// Number of ids sent per bulk read while prefetching remote state
    pub query_chunk_size: i32,

    /// Repair jobs bypass the "already done" skip rule
    pub is_repair: bool,

    /// Origin of the job's items
    pub source: JobSource,

    /// Most recent top-level error, verbatim
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Timestamp when the job was created (FIFO key for the auto-queue)
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job last moved to running
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached completed or failed
    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the row was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Items not yet in a terminal state.
    pub fn pending_items(&self) -> i32 {
        self.total_items - self.successful_items - self.failed_items - self.skipped_items
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_item::Entity")]
    JobItem,
}

impl Related<super::job_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

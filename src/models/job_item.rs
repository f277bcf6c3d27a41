//! JobItem entity model
//!
//! One parent object to mutate within a job. Parent id and campaign context
//! are optional at ingestion and resolved while the owning account is
//! processed.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use super::ItemStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Owning job
    pub job_id: i32,

    /// Remote account the parent lives in
    pub account_id: String,

    /// Remote parent id, if known at ingestion
    pub parent_id: Option<String>,

    /// Parent display name, used to resolve a missing id
    #[sea_orm(column_type = "Text", nullable)]
    pub parent_name: Option<String>,

    pub campaign_id: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub campaign_name: Option<String>,

    /// Variant to apply (normalised key)
    pub variant: String,

    pub status: ItemStatus,

    /// Remote reference of the created child, once successful
    pub child_ref: Option<String>,

    /// Verbatim failure text or skip reason
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id",
        on_delete = "Cascade"
    )]
    Job,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

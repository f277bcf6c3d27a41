//! # JobItem Repository
//!
//! Item rows are written once at job creation and then only ever move out
//! of `pending`, each exactly once.

use std::collections::HashMap;

use chrono::Utc;
use sea_orm::prelude::*;
use sea_orm::{ConnectionTrait, NotSet, QueryOrder, QuerySelect, Set};

use crate::error::{LedgerError, map_db_err};
use crate::models::ItemStatus;
use crate::models::job_item::{ActiveModel, Column, Entity, Model};

/// One ingested record, before it belongs to a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct NewItem {
    pub account_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub campaign_name: Option<String>,
    pub variant: String,
}

#[derive(Clone)]
pub struct JobItemRepository {
    db: DatabaseConnection,
}

impl JobItemRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts `items` under `job_id` in batches of `batch_size` rows.
    pub async fn insert_many<C: ConnectionTrait>(
        conn: &C,
        job_id: i32,
        items: &[NewItem],
        batch_size: usize,
    ) -> Result<(), LedgerError> {
        let now = Utc::now().fixed_offset();
        for batch in items.chunks(batch_size.max(1)) {
            let rows = batch.iter().map(|item| ActiveModel {
                id: NotSet,
                job_id: Set(job_id),
                account_id: Set(item.account_id.clone()),
                parent_id: Set(item.parent_id.clone()),
                parent_name: Set(item.parent_name.clone()),
                campaign_id: Set(item.campaign_id.clone()),
                campaign_name: Set(item.campaign_name.clone()),
                variant: Set(item.variant.clone()),
                status: Set(ItemStatus::Pending),
                child_ref: Set(None),
                error_message: Set(None),
                processed_at: Set(None),
                created_at: Set(now),
            });
            Entity::insert_many(rows)
                .exec(conn)
                .await
                .map_err(|e| map_db_err("inserting job items", e))?;
        }
        Ok(())
    }

    /// Items still pending, in insertion order.
    pub async fn pending(&self, job_id: i32) -> Result<Vec<Model>, LedgerError> {
        self.list(job_id, Some(ItemStatus::Pending), None).await
    }

    pub async fn list(
        &self,
        job_id: i32,
        status: Option<ItemStatus>,
        limit: Option<u64>,
    ) -> Result<Vec<Model>, LedgerError> {
        let mut query = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::Id);
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status));
        }
        query
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("listing job items", e))
    }

    /// Most recently processed failures first.
    pub async fn recent_failures(&self, job_id: i32, limit: u64) -> Result<Vec<Model>, LedgerError> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(ItemStatus::Failed))
            .order_by_desc(Column::ProcessedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("loading recent failures", e))
    }

    pub async fn count_by_status(&self, job_id: i32) -> Result<HashMap<ItemStatus, i64>, LedgerError> {
        let rows: Vec<(ItemStatus, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .filter(Column::JobId.eq(job_id))
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("counting job items", e))?;
        Ok(rows.into_iter().collect())
    }

    /// Moves a pending item to a terminal status. Returns false when the
    /// item was no longer pending, so counters are only bumped once.
    pub async fn mark<C: ConnectionTrait>(
        conn: &C,
        job_id: i32,
        item_id: i32,
        status: ItemStatus,
        child_ref: Option<String>,
        message: Option<String>,
    ) -> Result<bool, LedgerError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::ChildRef, Expr::value(child_ref))
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(Column::ProcessedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(item_id))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(ItemStatus::Pending))
            .exec(conn)
            .await
            .map_err(|e| map_db_err("recording item result", e))?;
        Ok(result.rows_affected == 1)
    }

    pub async fn delete_for_job<C: ConnectionTrait>(conn: &C, job_id: i32) -> Result<u64, LedgerError> {
        let result = Entity::delete_many()
            .filter(Column::JobId.eq(job_id))
            .exec(conn)
            .await
            .map_err(|e| map_db_err("deleting job items", e))?;
        Ok(result.rows_affected)
    }
}

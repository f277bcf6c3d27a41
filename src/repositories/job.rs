//! # Job Repository
//!
//! Lifecycle transitions and aggregate counters for the jobs table.

use chrono::Utc;
use sea_orm::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, QuerySelect};
use tracing::{debug, info};

use crate::error::{LedgerError, map_db_err};
use crate::models::JobStatus;
use crate::models::job::{Column, Entity, Model};

/// Per-status deltas applied to a job's counters in one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub successful: i32,
    pub failed: i32,
    pub skipped: i32,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.successful == 0 && self.failed == 0 && self.skipped == 0
    }

    pub fn total(&self) -> i32 {
        self.successful + self.failed + self.skipped
    }
}

#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(&self, job_id: i32) -> Result<Option<Model>, LedgerError> {
        Entity::find_by_id(job_id)
            .one(&self.db)
            .await
            .map_err(|e| map_db_err("loading job", e))
    }

    pub async fn get(&self, job_id: i32) -> Result<Model, LedgerError> {
        self.find(job_id).await?.ok_or(LedgerError::JobNotFound(job_id))
    }

    /// Newest first.
    pub async fn list(&self, limit: u64) -> Result<Vec<Model>, LedgerError> {
        Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("listing jobs", e))
    }

    pub async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Model>, LedgerError> {
        Entity::find()
            .filter(Column::Status.eq(status))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("loading jobs by status", e))
    }

    /// Oldest pending job by creation time; the id breaks ties.
    pub async fn oldest_pending(&self) -> Result<Option<Model>, LedgerError> {
        Entity::find()
            .filter(Column::Status.eq(JobStatus::Pending))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await
            .map_err(|e| map_db_err("loading oldest pending job", e))
    }

    /// Moves the job to running if it is currently in one of `from`.
    /// Returns false when another caller got there first.
    pub async fn claim(&self, job_id: i32, from: &[JobStatus]) -> Result<bool, LedgerError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::CompletedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(from.iter().copied()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("claiming job", e))?;

        let claimed = result.rows_affected == 1;
        debug!(job_id, claimed, "Job claim attempted");
        Ok(claimed)
    }

    /// Conditional transition out of one of `from`. A terminal target also
    /// stamps `completed_at`; `error`, when given, replaces `last_error`.
    pub async fn transition(
        &self,
        job_id: i32,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<String>,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to))
            .col_expr(Column::UpdatedAt, Expr::value(now));
        if to.is_terminal() {
            update = update.col_expr(Column::CompletedAt, Expr::value(now));
        }
        if let Some(message) = error {
            update = update.col_expr(Column::LastError, Expr::value(message));
        }

        let result = update
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(from.iter().copied()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("transitioning job", e))?;

        let moved = result.rows_affected == 1;
        if moved {
            info!(job_id, to = %to, "Job state changed");
        }
        Ok(moved)
    }

    pub async fn set_last_error(&self, job_id: i32, message: &str) -> Result<(), LedgerError> {
        Entity::update_many()
            .col_expr(Column::LastError, Expr::value(message.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("recording job error", e))?;
        Ok(())
    }

    /// Adds `delta` to the job's counters with a single atomic UPDATE so
    /// concurrent writers never lose increments.
    pub async fn increment_counters<C: ConnectionTrait>(
        conn: &C,
        job_id: i32,
        delta: CounterDelta,
    ) -> Result<(), LedgerError> {
        if delta.is_zero() {
            return Ok(());
        }
        Entity::update_many()
            .col_expr(
                Column::SuccessfulItems,
                Expr::col(Column::SuccessfulItems).add(delta.successful),
            )
            .col_expr(Column::FailedItems, Expr::col(Column::FailedItems).add(delta.failed))
            .col_expr(Column::SkippedItems, Expr::col(Column::SkippedItems).add(delta.skipped))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .exec(conn)
            .await
            .map_err(|e| map_db_err("incrementing job counters", e))?;
        Ok(())
    }

    pub async fn delete<C: ConnectionTrait>(conn: &C, job_id: i32) -> Result<bool, LedgerError> {
        let result = Entity::delete_by_id(job_id)
            .exec(conn)
            .await
            .map_err(|e| map_db_err("deleting job", e))?;
        Ok(result.rows_affected > 0)
    }
}

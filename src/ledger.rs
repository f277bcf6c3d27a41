//! Item Ledger
//!
//! Durable Job and Item state; the unit of resumability. Result writes are
//! buffered and applied in batches, each batch in one transaction together
//! with the matching counter increments.

use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set, TransactionTrait};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, map_db_err};
use crate::models::{ItemStatus, JobSource, JobStatus, job, job_item};
use crate::repositories::job::CounterDelta;
use crate::repositories::system_setting::AUTO_QUEUE_KEY;
use crate::repositories::{JobItemRepository, JobRepository, SystemSettingRepository};

pub use crate::repositories::job_item::NewItem;

/// Everything needed to create a job row and its items.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub variant: String,
    pub items: Vec<NewItem>,
    pub query_chunk_size: usize,
    pub is_repair: bool,
    pub source: JobSource,
}

/// One terminal status transition for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub item_id: i32,
    pub status: ItemStatus,
    pub child_ref: Option<String>,
    /// Verbatim failure text or skip reason
    pub message: Option<String>,
}

/// Outcome of one `record_results` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub applied: CounterDelta,
    /// Updates ignored because the item had already left `pending`
    pub ignored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub item_id: i32,
    pub account_id: String,
    pub parent_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub id: i32,
    pub status: JobStatus,
    pub variant: String,
    pub is_repair: bool,
    pub source: JobSource,
    pub total: i32,
    pub successful: i32,
    pub failed: i32,
    pub skipped: i32,
    pub pending: i32,
    pub last_error: Option<String>,
    pub recent_failures: Vec<FailedItem>,
}

const RECENT_FAILURES: u64 = 10;

#[derive(Clone)]
pub struct ItemLedger {
    db: DatabaseConnection,
    jobs: JobRepository,
    items: JobItemRepository,
    settings: SystemSettingRepository,
    write_batch_size: usize,
}

impl ItemLedger {
    pub fn new(db: DatabaseConnection, write_batch_size: usize) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            items: JobItemRepository::new(db.clone()),
            settings: SystemSettingRepository::new(db.clone()),
            db,
            write_batch_size: write_batch_size.max(1),
        }
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    pub fn items(&self) -> &JobItemRepository {
        &self.items
    }

    /// Creates the job and all of its items atomically.
    pub async fn create_job(&self, new_job: NewJob) -> Result<i32, LedgerError> {
        let now = Utc::now().fixed_offset();
        let total = new_job.items.len() as i32;

        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| map_db_err("starting job creation", e))?;

        let row = job::ActiveModel {
            id: NotSet,
            status: Set(JobStatus::Pending),
            variant: Set(new_job.variant.clone()),
            total_items: Set(total),
            successful_items: Set(0),
            failed_items: Set(0),
            skipped_items: Set(0),
            query_chunk_size: Set(new_job.query_chunk_size as i32),
            is_repair: Set(new_job.is_repair),
            source: Set(new_job.source),
            last_error: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| map_db_err("inserting job", e))?;

        JobItemRepository::insert_many(&txn, row.id, &new_job.items, self.write_batch_size).await?;

        txn.commit()
            .await
            .map_err(|e| map_db_err("committing job creation", e))?;

        counter!("jobs_created_total", "source" => new_job.source.as_str()).increment(1);
        info!(
            job_id = row.id,
            total_items = total,
            variant = %new_job.variant,
            is_repair = new_job.is_repair,
            source = new_job.source.as_str(),
            "Job created"
        );
        Ok(row.id)
    }

    pub async fn get_job(&self, job_id: i32) -> Result<job::Model, LedgerError> {
        self.jobs.get(job_id).await
    }

    /// Only items still pending; terminal items are never handed out again.
    pub async fn get_pending_items(&self, job_id: i32) -> Result<Vec<job_item::Model>, LedgerError> {
        self.items.pending(job_id).await
    }

    /// Applies a batch of transitions. Each batch of `write_batch_size`
    /// updates runs in one transaction with its counter increment, so the
    /// counters always agree with the item rows.
    pub async fn record_results(
        &self,
        job_id: i32,
        updates: &[ItemUpdate],
    ) -> Result<RecordSummary, LedgerError> {
        let mut summary = RecordSummary::default();
        for batch in updates.chunks(self.write_batch_size) {
            let txn = self
                .db
                .begin()
                .await
                .map_err(|e| map_db_err("starting result batch", e))?;

            let mut delta = CounterDelta::default();
            for update in batch {
                let applied = JobItemRepository::mark(
                    &txn,
                    job_id,
                    update.item_id,
                    update.status,
                    update.child_ref.clone(),
                    update.message.clone(),
                )
                .await?;
                if !applied {
                    summary.ignored += 1;
                    continue;
                }
                match update.status {
                    ItemStatus::Successful => delta.successful += 1,
                    ItemStatus::Failed => delta.failed += 1,
                    ItemStatus::Skipped => delta.skipped += 1,
                    ItemStatus::Pending => {}
                }
            }

            JobRepository::increment_counters(&txn, job_id, delta).await?;
            txn.commit()
                .await
                .map_err(|e| map_db_err("committing result batch", e))?;

            summary.applied.successful += delta.successful;
            summary.applied.failed += delta.failed;
            summary.applied.skipped += delta.skipped;
            counter!("ledger_flush_total").increment(1);
        }

        if summary.ignored > 0 {
            warn!(job_id, ignored = summary.ignored, "Ignored updates for items no longer pending");
        }
        counter!("job_items_total", "status" => "successful")
            .increment(summary.applied.successful as u64);
        counter!("job_items_total", "status" => "failed").increment(summary.applied.failed as u64);
        counter!("job_items_total", "status" => "skipped").increment(summary.applied.skipped as u64);
        debug!(job_id, applied = summary.applied.total(), "Recorded item results");
        Ok(summary)
    }

    /// A write buffer owned by one processing pass of `job_id`.
    pub fn buffer(&self, job_id: i32) -> ResultBuffer {
        ResultBuffer {
            ledger: self.clone(),
            job_id,
            pending: Vec::with_capacity(self.write_batch_size),
            capacity: self.write_batch_size,
        }
    }

    pub async fn job_status(&self, job_id: i32) -> Result<JobStatusReport, LedgerError> {
        let job = self.jobs.get(job_id).await?;
        let failures = self.items.recent_failures(job_id, RECENT_FAILURES).await?;
        Ok(JobStatusReport {
            id: job.id,
            status: job.status,
            pending: job.pending_items(),
            variant: job.variant,
            is_repair: job.is_repair,
            source: job.source,
            total: job.total_items,
            successful: job.successful_items,
            failed: job.failed_items,
            skipped: job.skipped_items,
            last_error: job.last_error,
            recent_failures: failures
                .into_iter()
                .map(|item| FailedItem {
                    item_id: item.id,
                    account_id: item.account_id,
                    parent_id: item.parent_id,
                    error: item.error_message,
                })
                .collect(),
        })
    }

    pub async fn list_jobs(&self, limit: u64) -> Result<Vec<job::Model>, LedgerError> {
        self.jobs.list(limit).await
    }

    pub async fn list_items(
        &self,
        job_id: i32,
        status: Option<ItemStatus>,
    ) -> Result<Vec<job_item::Model>, LedgerError> {
        self.jobs.get(job_id).await?;
        self.items.list(job_id, status, None).await
    }

    /// Removes the job and its items in one transaction.
    pub async fn delete_job(&self, job_id: i32) -> Result<u64, LedgerError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| map_db_err("starting job deletion", e))?;
        let removed_items = JobItemRepository::delete_for_job(&txn, job_id).await?;
        if !JobRepository::delete(&txn, job_id).await? {
            txn.rollback()
                .await
                .map_err(|e| map_db_err("rolling back job deletion", e))?;
            return Err(LedgerError::JobNotFound(job_id));
        }
        txn.commit()
            .await
            .map_err(|e| map_db_err("committing job deletion", e))?;
        info!(job_id, removed_items, "Job deleted");
        Ok(removed_items)
    }

    /// Moves every `running` job for which `is_live` is false to `failed`
    /// with `message`. Pending items are left untouched for a later resume.
    pub async fn fail_stale_jobs<F>(&self, message: &str, is_live: F) -> Result<usize, LedgerError>
    where
        F: Fn(i32) -> bool,
    {
        let running = self.jobs.find_by_status(JobStatus::Running).await?;
        let mut recovered = 0;
        for job in running {
            if is_live(job.id) {
                continue;
            }
            let moved = self
                .jobs
                .transition(job.id, &[JobStatus::Running], JobStatus::Failed, Some(message.to_string()))
                .await?;
            if moved {
                warn!(job_id = job.id, pending = job.pending_items(), "Stale running job marked failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub async fn auto_queue_enabled(&self) -> Result<bool, LedgerError> {
        self.settings.get_bool(AUTO_QUEUE_KEY).await
    }

    pub async fn set_auto_queue(&self, enabled: bool) -> Result<(), LedgerError> {
        self.settings.set_bool(AUTO_QUEUE_KEY, enabled).await?;
        info!(enabled, "Auto-queue flag updated");
        Ok(())
    }
}

/// Buffered item updates for one job. Flushes itself when full; the owner
/// must call `flush` once more when the pass ends, on every exit path.
pub struct ResultBuffer {
    ledger: ItemLedger,
    job_id: i32,
    pending: Vec<ItemUpdate>,
    capacity: usize,
}

impl ResultBuffer {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn push(&mut self, update: ItemUpdate) -> Result<(), LedgerError> {
        self.pending.push(update);
        if self.pending.len() >= self.capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes everything buffered. On error the updates stay buffered so a
    /// later flush can retry them.
    pub async fn flush(&mut self) -> Result<RecordSummary, LedgerError> {
        if self.pending.is_empty() {
            return Ok(RecordSummary::default());
        }
        let batch = std::mem::take(&mut self.pending);
        match self.ledger.record_results(self.job_id, &batch).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.pending = batch;
                Err(err)
            }
        }
    }
}

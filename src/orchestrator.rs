//! # Job Orchestrator
//!
//! Owns the job lifecycle (`pending -> running -> completed | failed |
//! paused`) and fans a running job out across accounts with bounded
//! concurrency and a pacing delay between account starts. Item results flow
//! through a channel to a single writer that owns the job's ledger buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{EngineError, LedgerError};
use crate::ledger::{ItemLedger, JobStatusReport, NewItem, NewJob, ResultBuffer};
use crate::models::{ItemStatus, JobSource, JobStatus, job, job_item};
use crate::processor::{AccountProcessor, JobContext, ProcessingResult};
use crate::templates::TemplateProvider;

pub const STALE_JOB_MESSAGE: &str =
    "job was running when the process stopped; resume it to retry the pending items";

/// Sent once a job reaches `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCompletion {
    pub job_id: i32,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub is_repair: bool,
    pub source: JobSource,
    /// Falls back to the configured default
    pub query_chunk_size: Option<usize>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            is_repair: false,
            source: JobSource::Ingest,
            query_chunk_size: None,
        }
    }
}

struct Inner {
    ledger: ItemLedger,
    processor: AccountProcessor,
    templates: Arc<dyn TemplateProvider>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<i32, CancellationToken>>,
    completions: Mutex<Option<mpsc::UnboundedSender<JobCompletion>>>,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        ledger: ItemLedger,
        processor: AccountProcessor,
        templates: Arc<dyn TemplateProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                processor,
                templates,
                config,
                active: Mutex::new(HashMap::new()),
                completions: Mutex::new(None),
            }),
        }
    }

    pub fn ledger(&self) -> &ItemLedger {
        &self.inner.ledger
    }

    /// Receiver for terminal job notifications. Replaces any previous one.
    pub fn subscribe_completions(&self) -> mpsc::UnboundedReceiver<JobCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .completions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(tx);
        rx
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<i32, CancellationToken>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn is_active(&self, job_id: i32) -> bool {
        self.active().contains_key(&job_id)
    }

    /// Validates and normalises `items`, then writes the job and its items.
    pub async fn create_job(&self, items: Vec<NewItem>, options: JobOptions) -> Result<i32, EngineError> {
        if items.is_empty() {
            return Err(EngineError::InvalidInput("a job needs at least one item".to_string()));
        }

        let mut variant: Option<String> = None;
        let mut normalized = Vec::with_capacity(items.len());
        for (index, mut item) in items.into_iter().enumerate() {
            let canonical = self
                .inner
                .templates
                .normalize_variant(&item.variant)
                .ok_or_else(|| EngineError::InvalidInput(format!("unknown variant '{}'", item.variant)))?;
            match &variant {
                None => variant = Some(canonical.clone()),
                Some(existing) if *existing != canonical => {
                    return Err(EngineError::InvalidInput(format!(
                        "item {index} has variant '{canonical}' but the job is '{existing}'"
                    )));
                }
                Some(_) => {}
            }
            if item.account_id.trim().is_empty() {
                return Err(EngineError::InvalidInput(format!("item {index} has no account id")));
            }
            if item.parent_id.is_none() && item.parent_name.is_none() {
                return Err(EngineError::InvalidInput(format!(
                    "item {index} needs a parent id or a parent name"
                )));
            }
            item.variant = canonical;
            normalized.push(item);
        }

        let variant = variant.unwrap_or_default();
        let job_id = self
            .inner
            .ledger
            .create_job(NewJob {
                variant,
                items: normalized,
                query_chunk_size: options
                    .query_chunk_size
                    .unwrap_or(self.inner.config.default_query_chunk_size)
                    .max(1),
                is_repair: options.is_repair,
                source: options.source,
            })
            .await?;
        Ok(job_id)
    }

    /// Starts a pending job in the background.
    pub async fn start_job(&self, job_id: i32) -> Result<JoinHandle<()>, EngineError> {
        self.launch(job_id, &[JobStatus::Pending]).await
    }

    /// Restarts a paused or failed job; only its pending items are processed.
    pub async fn resume_job(&self, job_id: i32) -> Result<JoinHandle<()>, EngineError> {
        self.launch(job_id, &[JobStatus::Paused, JobStatus::Failed]).await
    }

    async fn launch(&self, job_id: i32, from: &[JobStatus]) -> Result<JoinHandle<()>, EngineError> {
        let job = self.inner.ledger.get_job(job_id).await?;
        if self.is_active(job_id) {
            return Err(EngineError::StillActive(job_id));
        }
        if !from.contains(&job.status) || !self.inner.ledger.jobs().claim(job_id, from).await? {
            let current = self.inner.ledger.get_job(job_id).await?.status;
            return Err(EngineError::InvalidTransition {
                job_id,
                from: current,
                to: JobStatus::Running,
            });
        }

        let token = CancellationToken::new();
        self.active().insert(job_id, token.clone());
        gauge!("orchestrator_active_jobs").set(self.active().len() as f64);
        info!(job_id, from = %job.status, "Job started");

        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.execute(job_id, token).await;
        }))
    }

    /// Stops dispatching new chunks; in-flight chunks finish and are recorded.
    pub async fn pause_job(&self, job_id: i32) -> Result<(), EngineError> {
        let job = self.inner.ledger.get_job(job_id).await?;
        if !self
            .inner
            .ledger
            .jobs()
            .transition(job_id, &[JobStatus::Running], JobStatus::Paused, None)
            .await?
        {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Paused,
            });
        }
        if let Some(token) = self.active().get(&job_id) {
            token.cancel();
        }
        info!(job_id, "Job paused");
        Ok(())
    }

    pub async fn delete_job(&self, job_id: i32) -> Result<(), EngineError> {
        let job = self.inner.ledger.get_job(job_id).await?;
        if job.status == JobStatus::Running || self.is_active(job_id) {
            return Err(EngineError::JobRunning(job_id));
        }
        self.inner.ledger.delete_job(job_id).await?;
        Ok(())
    }

    pub async fn job_status(&self, job_id: i32) -> Result<JobStatusReport, EngineError> {
        Ok(self.inner.ledger.job_status(job_id).await?)
    }

    pub async fn list_jobs(&self, limit: u64) -> Result<Vec<job::Model>, EngineError> {
        Ok(self.inner.ledger.list_jobs(limit).await?)
    }

    pub async fn list_items(
        &self,
        job_id: i32,
        status: Option<ItemStatus>,
    ) -> Result<Vec<job_item::Model>, EngineError> {
        Ok(self.inner.ledger.list_items(job_id, status).await?)
    }

    pub async fn set_auto_queue(&self, enabled: bool) -> Result<(), EngineError> {
        Ok(self.inner.ledger.set_auto_queue(enabled).await?)
    }

    pub async fn auto_queue_enabled(&self) -> Result<bool, EngineError> {
        Ok(self.inner.ledger.auto_queue_enabled().await?)
    }

    /// Fails every `running` job this process is not executing. Call once
    /// at startup, before any job is started.
    pub async fn recover_stale_jobs(&self) -> Result<usize, EngineError> {
        let recovered = self
            .inner
            .ledger
            .fail_stale_jobs(STALE_JOB_MESSAGE, |job_id| self.is_active(job_id))
            .await?;
        Ok(recovered)
    }

    #[instrument(skip(self, token), fields(run_id = %Uuid::new_v4()))]
    async fn execute(&self, job_id: i32, token: CancellationToken) {
        let outcome = self.run(job_id, &token).await;
        let status = match outcome {
            Ok(status) => status,
            Err(err) => {
                error!(job_id, error = %err, "Job execution failed");
                let message = err.to_string();
                match self
                    .inner
                    .ledger
                    .jobs()
                    .transition(job_id, &[JobStatus::Running], JobStatus::Failed, Some(message))
                    .await
                {
                    Ok(true) => Some(JobStatus::Failed),
                    Ok(false) => None,
                    Err(db_err) => {
                        error!(job_id, error = %db_err, "Could not mark job failed");
                        None
                    }
                }
            }
        };

        self.active().remove(&job_id);
        gauge!("orchestrator_active_jobs").set(self.active().len() as f64);

        if let Some(status) = status {
            counter!("jobs_finished_total", "status" => status.as_str()).increment(1);
            info!(job_id, status = %status, "Job finished");
            self.notify(JobCompletion { job_id, status });
        }
    }

    fn notify(&self, completion: JobCompletion) {
        let guard = self
            .inner
            .completions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.send(completion).is_err() {
                warn!(job_id = completion.job_id, "Completion receiver dropped");
            }
        }
    }

    /// Processes the job's pending items. Returns the terminal status it
    /// reached, or `None` when the job was paused with work left.
    async fn run(&self, job_id: i32, token: &CancellationToken) -> Result<Option<JobStatus>, EngineError> {
        let job = self.inner.ledger.get_job(job_id).await?;
        let ctx = JobContext::from(&job);
        let pending = self.inner.ledger.get_pending_items(job_id).await?;
        let accounts = group_by_account(pending);
        info!(
            job_id,
            accounts = accounts.len(),
            pending = job.pending_items(),
            is_repair = job.is_repair,
            "Dispatching job"
        );

        let (tx, rx) = mpsc::channel::<Vec<ProcessingResult>>(64);
        let writer = tokio::spawn(write_results(self.inner.ledger.buffer(job_id), rx));

        let semaphore = Arc::new(Semaphore::new(self.inner.config.account_concurrency.max(1)));
        let pacing = Duration::from_millis(self.inner.config.account_pacing_ms);
        let mut tasks = JoinSet::new();
        let account_count = accounts.len();

        for (index, (account, items)) in accounts.into_iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if token.is_cancelled() {
                info!(job_id, remaining_accounts = account_count - index, "Pause requested; not starting more accounts");
                break;
            }

            let processor = self.inner.processor.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            let task_token = token.clone();
            tasks.spawn(async move {
                let report = processor.process(&account, &ctx, items, &task_token).await;
                if tx.send(report.results).await.is_err() {
                    error!(account_id = %account, "Result writer stopped before account finished");
                }
                drop(permit);
                report.account_error
            });

            if index + 1 < account_count && !pacing.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(pacing) => {}
                }
            }
        }
        drop(tx);

        let mut last_error: Option<String> = None;
        let mut finished_accounts = 0usize;
        let mut aborted_accounts = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(account_error)) => {
                    aborted_accounts += 1;
                    last_error = Some(account_error);
                }
                Ok(None) => finished_accounts += 1,
                Err(err) => {
                    aborted_accounts += 1;
                    error!(job_id, error = %err, "Account task panicked");
                    last_error = Some(format!("account task panicked: {err}"));
                }
            }
        }

        match writer.await {
            Ok(Ok(written)) => info!(job_id, written, "Results written"),
            Ok(Err(err)) => return Err(err.into()),
            Err(err) => {
                return Err(EngineError::TaskFailed(format!("result writer panicked: {err}")));
            }
        }

        if let Some(message) = &last_error {
            self.inner.ledger.jobs().set_last_error(job_id, message).await?;
        }

        let job = self.inner.ledger.get_job(job_id).await?;
        let jobs = self.inner.ledger.jobs();
        if job.pending_items() == 0 && finished_accounts == 0 && aborted_accounts > 0 {
            warn!(job_id, aborted_accounts, "Every account aborted");
            let message = last_error.unwrap_or_else(|| "every account aborted".to_string());
            let moved = jobs
                .transition(job_id, &[JobStatus::Running, JobStatus::Paused], JobStatus::Failed, Some(message))
                .await?;
            return Ok(moved.then_some(JobStatus::Failed));
        }
        if job.pending_items() == 0 {
            // A pause that arrived after the last chunk still completes the job.
            let moved = jobs
                .transition(job_id, &[JobStatus::Running, JobStatus::Paused], JobStatus::Completed, None)
                .await?;
            return Ok(moved.then_some(JobStatus::Completed));
        }
        if token.is_cancelled() {
            info!(job_id, pending = job.pending_items(), "Job paused with pending items");
            return Ok(None);
        }

        let message = last_error
            .unwrap_or_else(|| format!("{} items were left pending", job.pending_items()));
        let moved = jobs
            .transition(job_id, &[JobStatus::Running], JobStatus::Failed, Some(message))
            .await?;
        Ok(moved.then_some(JobStatus::Failed))
    }
}

/// Preserves first-seen account order.
fn group_by_account(items: Vec<job_item::Model>) -> Vec<(String, Vec<job_item::Model>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<job_item::Model>)> = Vec::new();
    for item in items {
        match index.get(&item.account_id) {
            Some(&position) => groups[position].1.push(item),
            None => {
                index.insert(item.account_id.clone(), groups.len());
                groups.push((item.account_id.clone(), vec![item]));
            }
        }
    }
    groups
}

/// Single owner of the job's write buffer. The final flush runs however the
/// account tasks ended.
async fn write_results(
    mut buffer: ResultBuffer,
    mut rx: mpsc::Receiver<Vec<ProcessingResult>>,
) -> Result<usize, LedgerError> {
    let mut written = 0;
    while let Some(results) = rx.recv().await {
        for update in results.iter().filter_map(ProcessingResult::to_update) {
            written += 1;
            if let Err(err) = buffer.push(update).await {
                error!(error = %err, buffered = buffer.len(), "Ledger flush failed; keeping updates buffered");
            }
        }
    }
    buffer.flush().await?;
    Ok(written)
}

//! # Auto-Queue Scheduler
//!
//! Listens for terminal job notifications. Each one schedules a detached
//! task that waits out the cooldown, re-reads the persisted flag and starts
//! the oldest pending job. The job that just finished never waits on it.

use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::AutoQueueConfig;
use crate::error::EngineError;
use crate::orchestrator::{JobCompletion, JobOrchestrator};

#[derive(Clone)]
pub struct AutoQueueScheduler {
    orchestrator: JobOrchestrator,
    cooldown: Duration,
}

impl AutoQueueScheduler {
    pub fn new(orchestrator: JobOrchestrator, config: &AutoQueueConfig) -> Self {
        Self {
            orchestrator,
            cooldown: Duration::from_secs(config.cooldown_seconds),
        }
    }

    /// Override the cooldown (primarily for tests).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Runs until `shutdown` fires or the orchestrator drops its sender.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut completions: mpsc::UnboundedReceiver<JobCompletion>,
        shutdown: CancellationToken,
    ) {
        info!(cooldown_seconds = self.cooldown.as_secs(), "Starting auto-queue scheduler");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Auto-queue shutdown requested");
                    break;
                }
                completion = completions.recv() => {
                    let Some(completion) = completion else {
                        break;
                    };
                    debug!(job_id = completion.job_id, status = %completion.status, "Job reached terminal state");
                    self.schedule(shutdown.clone());
                }
            }
        }
        info!("Auto-queue scheduler stopped");
    }

    /// Spawns the cooldown-then-dequeue step without awaiting it.
    pub fn schedule(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(this.cooldown) => {}
            }
            if let Err(err) = this.dequeue_next().await {
                error!(error = %err, "Auto-queue could not start the next job");
            }
        })
    }

    /// Starts the oldest pending job if the flag is on. Returns its id.
    pub async fn dequeue_next(&self) -> Result<Option<i32>, EngineError> {
        if !self.orchestrator.auto_queue_enabled().await? {
            debug!("Auto-queue disabled; not starting another job");
            return Ok(None);
        }
        let Some(job) = self.orchestrator.ledger().jobs().oldest_pending().await? else {
            debug!("No pending jobs to auto-queue");
            return Ok(None);
        };

        match self.orchestrator.start_job(job.id).await {
            Ok(_) => {
                counter!("auto_queue_starts_total").increment(1);
                info!(job_id = job.id, "Auto-queue started next job");
                Ok(Some(job.id))
            }
            // Started by someone else in the meantime.
            Err(EngineError::InvalidTransition { .. }) | Err(EngineError::StillActive(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

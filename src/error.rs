//! Error types shared by the ledger and the engine components.

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;

use crate::accounts::AccountSourceError;
use crate::models::JobStatus;
use crate::remote::RemoteError;
use crate::templates::TemplateError;

/// Failures raised by the persistence layer.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error while {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("job {0} not found")]
    JobNotFound(i32),
}

/// Failures surfaced by the orchestration API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: i32,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} is running; pause it before deleting")]
    JobRunning(i32),
    #[error("job {0} is still finishing in-flight work; try again shortly")]
    StillActive(i32),
    #[error("invalid job input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Accounts(#[from] AccountSourceError),
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// Logs and wraps a database error with the operation that produced it.
pub fn map_db_err(context: &'static str, err: DbErr) -> LedgerError {
    error!(error = %err, context, "Database operation failed");
    LedgerError::Database {
        context,
        source: err,
    }
}

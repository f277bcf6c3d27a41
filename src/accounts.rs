//! Account sources
//!
//! Discovery and reconciliation iterate over a list of account ids supplied
//! by an `AccountSource`; the engine does not care where the list lives.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AccountSourceError {
    #[error("failed to read accounts file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn accounts(&self) -> Result<Vec<String>, AccountSourceError>;
}

/// Fixed, in-memory account list.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts(pub Vec<String>);

#[async_trait]
impl AccountSource for StaticAccounts {
    async fn accounts(&self) -> Result<Vec<String>, AccountSourceError> {
        Ok(self.0.clone())
    }
}

/// One account id per line. Blank lines and `#` comments are ignored, as
/// are dashes inside ids (`123-456-7890` reads as `1234567890`).
#[derive(Debug, Clone)]
pub struct AccountsFile {
    path: PathBuf,
}

impl AccountsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn parse_accounts(contents: &str) -> Vec<String> {
    let mut accounts: Vec<String> = Vec::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let id: String = line.chars().filter(|c| *c != '-').collect();
        if !accounts.contains(&id) {
            accounts.push(id);
        }
    }
    accounts
}

#[async_trait]
impl AccountSource for AccountsFile {
    async fn accounts(&self) -> Result<Vec<String>, AccountSourceError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AccountSourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        let accounts = parse_accounts(&contents);
        debug!(path = %self.path.display(), count = accounts.len(), "Loaded accounts file");
        Ok(accounts)
    }
}

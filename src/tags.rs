//! Tag families and the per-account tag id cache.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::governor::RateGovernor;
use crate::mutator::{ChunkedMutator, KeyedOperation};
use crate::remote::{Operation, RemoteApi, RemoteError};
use crate::retry::{RetryClassifier, retry_read};

/// Marks the child a themed child superseded; shared by every variant.
pub const ORIGINAL_TAG: &str = "THEMA_ORIGINAL";

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Names of every tag family for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagNames {
    pub variant: String,
    pub done: String,
    pub attempted: String,
    pub audited: String,
    pub original: String,
}

impl TagNames {
    pub fn for_variant_tag(tag: &str) -> Self {
        Self {
            variant: tag.to_string(),
            done: format!("{tag}_DONE"),
            attempted: format!("{tag}_ATTEMPTED"),
            audited: format!("{tag}_AUDITED"),
            original: ORIGINAL_TAG.to_string(),
        }
    }
}

/// Resolves tag names to ids, creating missing tags once per account.
pub struct TagCache {
    remote: Arc<dyn RemoteApi>,
    classifier: RetryClassifier,
    mutator: ChunkedMutator,
    ids: Mutex<LruCache<(String, String), String>>,
    /// One creator per account at a time
    creation_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TagCache {
    pub fn new(remote: Arc<dyn RemoteApi>, classifier: RetryClassifier, mutator: ChunkedMutator) -> Self {
        Self::with_capacity(remote, classifier, mutator, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        remote: Arc<dyn RemoteApi>,
        classifier: RetryClassifier,
        mutator: ChunkedMutator,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            remote,
            classifier,
            mutator,
            ids: Mutex::new(LruCache::new(capacity)),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, account: &str, name: &str) -> Option<String> {
        let mut ids = self.ids.lock().unwrap_or_else(|poison| poison.into_inner());
        ids.get(&(account.to_string(), name.to_string())).cloned()
    }

    fn remember(&self, account: &str, name: &str, id: &str) {
        let mut ids = self.ids.lock().unwrap_or_else(|poison| poison.into_inner());
        ids.put((account.to_string(), name.to_string()), id.to_string());
    }

    fn creation_lock(&self, account: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .creation_locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        locks.entry(account.to_string()).or_default().clone()
    }

    /// Fills `resolved` from the cache; returns the names still unknown.
    fn split_cached<'a>(
        &self,
        account: &str,
        names: &[&'a str],
        resolved: &mut HashMap<String, String>,
    ) -> Vec<&'a str> {
        let mut missing = Vec::new();
        for name in names {
            match self.cached(account, name) {
                Some(id) => {
                    resolved.insert(name.to_string(), id);
                }
                None => missing.push(*name),
            }
        }
        missing
    }

    /// Lists the account's tags and records those in `wanted`.
    async fn absorb_existing(
        &self,
        account: &str,
        wanted: &[&str],
        resolved: &mut HashMap<String, String>,
    ) -> Result<(), RemoteError> {
        let existing = retry_read(&self.classifier, "list_tags", || self.remote.list_tags(account)).await?;
        for tag in existing {
            if wanted.contains(&tag.name.as_str()) {
                self.remember(account, &tag.name, &tag.id);
                resolved.insert(tag.name, tag.id);
            }
        }
        Ok(())
    }

    /// Returns `name -> id` for every requested name, creating the missing
    /// ones through the mutator. Creation is never cancelled.
    ///
    /// A create that fails because the tag appeared in the meantime (another
    /// job or process) is settled by listing the account's tags again.
    pub async fn resolve(
        &self,
        account: &str,
        names: &[&str],
        governor: &RateGovernor,
    ) -> Result<HashMap<String, String>, RemoteError> {
        let mut resolved = HashMap::with_capacity(names.len());
        if self.split_cached(account, names, &mut resolved).is_empty() {
            return Ok(resolved);
        }

        let lock = self.creation_lock(account);
        let _creating = lock.lock().await;
        // Another task may have created them while we waited.
        let missing = self.split_cached(account, names, &mut resolved);
        if missing.is_empty() {
            return Ok(resolved);
        }

        self.absorb_existing(account, &missing, &mut resolved).await?;

        let to_create: Vec<KeyedOperation> = missing
            .iter()
            .filter(|name| !resolved.contains_key(**name))
            .map(|name| {
                KeyedOperation::new(
                    *name,
                    Operation::CreateTag {
                        name: name.to_string(),
                    },
                )
            })
            .collect();
        if to_create.is_empty() {
            return Ok(resolved);
        }

        info!(account = %account, count = to_create.len(), "Creating missing tags");
        let report = self
            .mutator
            .execute(
                account,
                to_create,
                self.mutator.default_chunk_size(),
                governor,
                &CancellationToken::new(),
            )
            .await;

        for (name, id) in report.succeeded {
            debug!(account = %account, tag = %name, tag_id = %id, "Tag created");
            self.remember(account, &name, &id);
            resolved.insert(name, id);
        }
        if report.failed.is_empty() {
            return Ok(resolved);
        }

        warn!(account = %account, failed = report.failed.len(), "Tag creation failed; re-listing tags");
        let failed_names: Vec<&str> = report.failed.keys().map(String::as_str).collect();
        self.absorb_existing(account, &failed_names, &mut resolved).await?;
        match report.failed.iter().find(|(name, _)| !resolved.contains_key(name.as_str())) {
            Some((name, failure)) => Err(RemoteError::new(format!(
                "could not create tag {name}: {}",
                failure.error
            ))),
            None => Ok(resolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_families_derive_from_variant_tag() {
        let names = TagNames::for_variant_tag("THEME_BF");
        assert_eq!(names.variant, "THEME_BF");
        assert_eq!(names.done, "THEME_BF_DONE");
        assert_eq!(names.attempted, "THEME_BF_ATTEMPTED");
        assert_eq!(names.audited, "THEME_BF_AUDITED");
        assert_eq!(names.original, "THEMA_ORIGINAL");
    }
}

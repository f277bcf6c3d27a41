//! Discovery and Reconciliation
//!
//! Discovery finds parents matching a name filter that do not yet carry the
//! variant's done or attempted tag and queues them as new jobs.
//! Reconciliation re-checks parents that carry the done tag: verified ones
//! get the audited tag, the rest lose the done tag and are queued as repair
//! jobs. Both read remote state in batches, never per parent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::accounts::AccountSource;
use crate::config::{DiscoveryConfig, GovernorConfig};
use crate::error::EngineError;
use crate::governor::RateGovernor;
use crate::ledger::NewItem;
use crate::models::JobSource;
use crate::mutator::{ChunkedMutator, KeyedOperation};
use crate::orchestrator::{JobOptions, JobOrchestrator};
use crate::remote::{Operation, ParentQuery, RemoteApi, RemoteError, RemoteParent, RemoteTag, TagTarget};
use crate::retry::{RetryClassifier, retry_read};
use crate::tags::{TagCache, TagNames};
use crate::templates::TemplateProvider;

#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub variant: String,
    /// Parent-name fragment to match
    pub name_contains: String,
    /// Cap on queued items across all accounts
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub found: usize,
    pub already_done: usize,
    pub already_attempted: usize,
    pub queued: usize,
    pub job_ids: Vec<i32>,
    /// Accounts whose remote reads failed, with the verbatim error
    pub failed_accounts: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub variant: String,
    /// Cap on parents checked across all accounts
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub already_audited: usize,
    pub verified: usize,
    pub missing: usize,
    /// Tag operations the remote rejected
    pub tag_failures: usize,
    pub job_ids: Vec<i32>,
    pub failed_accounts: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    remote: Arc<dyn RemoteApi>,
    templates: Arc<dyn TemplateProvider>,
    accounts: Arc<dyn AccountSource>,
    orchestrator: JobOrchestrator,
    mutator: ChunkedMutator,
    tags: Arc<TagCache>,
    classifier: RetryClassifier,
    governor_config: GovernorConfig,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        templates: Arc<dyn TemplateProvider>,
        accounts: Arc<dyn AccountSource>,
        orchestrator: JobOrchestrator,
        mutator: ChunkedMutator,
        tags: Arc<TagCache>,
        classifier: RetryClassifier,
        governor_config: GovernorConfig,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            remote,
            templates,
            accounts,
            orchestrator,
            mutator,
            tags,
            classifier,
            governor_config,
            config,
        }
    }

    fn tag_names(&self, raw_variant: &str) -> Result<(String, TagNames), EngineError> {
        let variant = self
            .templates
            .normalize_variant(raw_variant)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown variant '{raw_variant}'")))?;
        let tag = self.templates.variant_tag(&variant)?;
        Ok((variant, TagNames::for_variant_tag(&tag)))
    }

    #[instrument(skip_all, fields(variant = %request.variant, filter = %request.name_contains))]
    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryReport, EngineError> {
        let (variant, names) = self.tag_names(&request.variant)?;
        let limit = request.limit.unwrap_or(usize::MAX);
        let mut report = DiscoveryReport::default();
        let mut items: Vec<NewItem> = Vec::new();

        for account in self.accounts.accounts().await? {
            if items.len() >= limit {
                break;
            }
            let scan = self.scan_account(&account, &request.name_contains, &names).await;
            let (parents, tags) = match scan {
                Ok(found) => found,
                Err(err) => {
                    warn!(account_id = %account, error = %err, "Discovery skipped account");
                    report.failed_accounts.push((account, err.message));
                    continue;
                }
            };

            report.found += parents.len();
            for parent in parents {
                let carried = tags.get(&parent.id);
                let has = |name: &str| carried.is_some_and(|set| set.contains(name));
                if has(names.done.as_str()) {
                    report.already_done += 1;
                } else if has(names.attempted.as_str()) {
                    report.already_attempted += 1;
                } else if items.len() < limit {
                    items.push(new_item(&account, parent, &variant));
                }
            }
        }

        report.queued = items.len();
        report.job_ids = self.queue_jobs(items, false, JobSource::Discovery).await?;
        info!(
            found = report.found,
            already_done = report.already_done,
            already_attempted = report.already_attempted,
            queued = report.queued,
            jobs = report.job_ids.len(),
            "Discovery finished"
        );
        Ok(report)
    }

    async fn scan_account(
        &self,
        account: &str,
        fragment: &str,
        names: &TagNames,
    ) -> Result<(Vec<RemoteParent>, HashMap<String, HashSet<String>>), RemoteError> {
        let query = ParentQuery::NameContains(fragment.to_string());
        let parents = dedupe(
            retry_read(&self.classifier, "search_parents", || {
                self.remote.search_parents(account, &query)
            })
            .await?,
        );
        let ids: Vec<String> = parents.iter().map(|parent| parent.id.clone()).collect();
        let links = self.parent_tag_links(account, &ids).await?;

        let relevant = [names.done.as_str(), names.attempted.as_str()];
        let mut tags: HashMap<String, HashSet<String>> = HashMap::new();
        for (parent_id, tag) in links {
            if relevant.contains(&tag.name.as_str()) {
                tags.entry(parent_id).or_default().insert(tag.name);
            }
        }
        Ok((parents, tags))
    }

    async fn parent_tag_links(
        &self,
        account: &str,
        parent_ids: &[String],
    ) -> Result<Vec<(String, RemoteTag)>, RemoteError> {
        let mut links = Vec::new();
        for chunk in parent_ids.chunks(self.config.query_batch_size.max(1)) {
            let batch = retry_read(&self.classifier, "parent_tags", || {
                self.remote.parent_tags(account, chunk)
            })
            .await?;
            links.extend(batch.into_iter().map(|link| (link.target_id, link.tag)));
        }
        Ok(links)
    }

    #[instrument(skip_all, fields(variant = %request.variant))]
    pub async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileReport, EngineError> {
        let (variant, names) = self.tag_names(&request.variant)?;
        let limit = request.limit.unwrap_or(usize::MAX);
        let mut report = ReconcileReport::default();
        let mut repairs: Vec<NewItem> = Vec::new();

        for account in self.accounts.accounts().await? {
            if report.checked >= limit {
                break;
            }
            let budget = limit - report.checked;
            match self
                .reconcile_account(&account, &variant, &names, budget, &mut report)
                .await
            {
                Ok(mut missing) => repairs.append(&mut missing),
                Err(err) => {
                    warn!(account_id = %account, error = %err, "Reconciliation skipped account");
                    report.failed_accounts.push((account, err.message));
                }
            }
        }

        report.job_ids = self
            .queue_jobs(repairs, true, JobSource::Reconciliation)
            .await?;
        info!(
            checked = report.checked,
            already_audited = report.already_audited,
            verified = report.verified,
            missing = report.missing,
            jobs = report.job_ids.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Returns the repair items for one account.
    async fn reconcile_account(
        &self,
        account: &str,
        variant: &str,
        names: &TagNames,
        budget: usize,
        report: &mut ReconcileReport,
    ) -> Result<Vec<NewItem>, RemoteError> {
        let query = ParentQuery::TaggedWith(names.done.clone());
        let parents = dedupe(
            retry_read(&self.classifier, "search_parents", || {
                self.remote.search_parents(account, &query)
            })
            .await?,
        );
        let ids: Vec<String> = parents.iter().map(|parent| parent.id.clone()).collect();

        let mut done_tag_id: Option<String> = None;
        let mut audited: HashSet<String> = HashSet::new();
        for (parent_id, tag) in self.parent_tag_links(account, &ids).await? {
            if tag.name == names.done {
                done_tag_id.get_or_insert(tag.id);
            } else if tag.name == names.audited {
                audited.insert(parent_id);
            }
        }

        let mut to_check = Vec::new();
        for parent in parents {
            if audited.contains(&parent.id) {
                report.already_audited += 1;
            } else if to_check.len() < budget {
                to_check.push(parent);
            }
        }
        report.checked += to_check.len();
        if to_check.is_empty() {
            return Ok(Vec::new());
        }

        let verified = self.verified_parents(account, &to_check, &names.variant).await?;
        let (ok, missing): (Vec<RemoteParent>, Vec<RemoteParent>) = to_check
            .into_iter()
            .partition(|parent| verified.contains(&parent.id));
        report.verified += ok.len();
        report.missing += missing.len();

        let governor = RateGovernor::new(self.governor_config.clone());
        let mut ops = Vec::with_capacity(ok.len() + missing.len());
        if !ok.is_empty() {
            let audited_id = self
                .tags
                .resolve(account, &[names.audited.as_str()], &governor)
                .await?
                .remove(&names.audited)
                .unwrap_or_default();
            ops.extend(ok.iter().map(|parent| {
                KeyedOperation::new(
                    format!("{}:audited", parent.id),
                    Operation::AttachTag {
                        target: TagTarget::Parent(parent.id.clone()),
                        tag_id: audited_id.clone(),
                    },
                )
            }));
        }
        if let Some(done_id) = &done_tag_id {
            // Explicit unlink per parent; tag deletion is never relied on to cascade.
            ops.extend(missing.iter().map(|parent| {
                KeyedOperation::new(
                    format!("{}:undone", parent.id),
                    Operation::DetachTag {
                        target: TagTarget::Parent(parent.id.clone()),
                        tag_id: done_id.clone(),
                    },
                )
            }));
        }

        let outcome = self
            .mutator
            .execute(
                account,
                ops,
                self.config.mutation_batch_size,
                &governor,
                &CancellationToken::new(),
            )
            .await;
        for (key, failure) in &outcome.failed {
            warn!(account_id = %account, operation = %key, error = %failure.error, "Reconciliation tag operation failed");
        }
        report.tag_failures += outcome.failed.len();

        Ok(missing
            .into_iter()
            .map(|parent| new_item(account, parent, variant))
            .collect())
    }

    /// Parents with at least one child carrying `variant_tag`.
    async fn verified_parents(
        &self,
        account: &str,
        parents: &[RemoteParent],
        variant_tag: &str,
    ) -> Result<HashSet<String>, RemoteError> {
        let ids: Vec<String> = parents.iter().map(|parent| parent.id.clone()).collect();
        let batch = self.config.query_batch_size.max(1);

        let mut parent_of: HashMap<String, String> = HashMap::new();
        for chunk in ids.chunks(batch) {
            let children = retry_read(&self.classifier, "children", || {
                self.remote.children(account, chunk)
            })
            .await?;
            for child in children {
                parent_of.insert(child.id, child.parent_id);
            }
        }

        let child_ids: Vec<String> = parent_of.keys().cloned().collect();
        let mut verified = HashSet::new();
        for chunk in child_ids.chunks(batch) {
            let links = retry_read(&self.classifier, "child_tags", || {
                self.remote.child_tags(account, chunk)
            })
            .await?;
            for link in links {
                if link.tag.name == variant_tag {
                    if let Some(parent_id) = parent_of.get(&link.target_id) {
                        verified.insert(parent_id.clone());
                    }
                }
            }
        }
        Ok(verified)
    }

    async fn queue_jobs(
        &self,
        items: Vec<NewItem>,
        is_repair: bool,
        source: JobSource,
    ) -> Result<Vec<i32>, EngineError> {
        let mut job_ids = Vec::new();
        for chunk in items.chunks(self.config.job_chunk_size.max(1)) {
            let job_id = self
                .orchestrator
                .create_job(
                    chunk.to_vec(),
                    JobOptions {
                        is_repair,
                        source,
                        query_chunk_size: None,
                    },
                )
                .await?;
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }
}

fn dedupe(parents: Vec<RemoteParent>) -> Vec<RemoteParent> {
    let mut seen = HashSet::with_capacity(parents.len());
    parents
        .into_iter()
        .filter(|parent| seen.insert(parent.id.clone()))
        .collect()
}

fn new_item(account: &str, parent: RemoteParent, variant: &str) -> NewItem {
    NewItem {
        account_id: account.to_string(),
        parent_id: Some(parent.id),
        parent_name: Some(parent.name),
        campaign_id: parent.campaign_id,
        campaign_name: parent.campaign_name,
        variant: variant.to_string(),
    }
}

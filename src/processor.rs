//! Account Processor
//!
//! Processes every pending item of one account: resolves missing parent
//! ids, prefetches parent tags and children in batches, builds the themed
//! children, creates them through the mutator and tags the results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::GovernorConfig;
use crate::governor::RateGovernor;
use crate::ledger::ItemUpdate;
use crate::models::{ItemStatus, job, job_item};
use crate::mutator::{ChunkedMutator, KeyedOperation, MutationReport};
use crate::remote::{Operation, ParentQuery, RemoteApi, RemoteChild, RemoteError, RemoteParent, TagTarget};
use crate::retry::{ErrorKind, RetryClassifier, retry_read};
use crate::tags::{TagCache, TagNames};
use crate::templates::{TemplateError, TemplateProvider};

/// Decided once, where the decision is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Successful { child_ref: String },
    Failed { reason: String },
    Skipped { reason: String },
    /// Not dispatched before a pause; stays pending for resume
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub item_id: i32,
    pub outcome: ItemOutcome,
}

impl ProcessingResult {
    fn new(item_id: i32, outcome: ItemOutcome) -> Self {
        Self { item_id, outcome }
    }

    /// Ledger transition for this result; `None` leaves the item pending.
    pub fn to_update(&self) -> Option<ItemUpdate> {
        let (status, child_ref, message) = match &self.outcome {
            ItemOutcome::Successful { child_ref } => (ItemStatus::Successful, Some(child_ref.clone()), None),
            ItemOutcome::Failed { reason } => (ItemStatus::Failed, None, Some(reason.clone())),
            ItemOutcome::Skipped { reason } => (ItemStatus::Skipped, None, Some(reason.clone())),
            ItemOutcome::Deferred => return None,
        };
        Some(ItemUpdate {
            item_id: self.item_id,
            status,
            child_ref,
            message,
        })
    }
}

/// Everything one account produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountReport {
    pub results: Vec<ProcessingResult>,
    /// Why the account stopped before finishing its items
    pub account_error: Option<String>,
}

/// Job-level settings the processor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: i32,
    pub variant: String,
    pub is_repair: bool,
    pub query_chunk_size: usize,
}

impl From<&job::Model> for JobContext {
    fn from(job: &job::Model) -> Self {
        Self {
            job_id: job.id,
            variant: job.variant.clone(),
            is_repair: job.is_repair,
            query_chunk_size: job.query_chunk_size.max(1) as usize,
        }
    }
}

/// An item with a buildable create operation.
struct Planned {
    item_id: i32,
    parent_id: String,
    base_child_id: String,
}

#[derive(Clone)]
pub struct AccountProcessor {
    remote: Arc<dyn RemoteApi>,
    templates: Arc<dyn TemplateProvider>,
    tags: Arc<TagCache>,
    mutator: ChunkedMutator,
    classifier: RetryClassifier,
    governor_config: GovernorConfig,
}

impl AccountProcessor {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        templates: Arc<dyn TemplateProvider>,
        tags: Arc<TagCache>,
        mutator: ChunkedMutator,
        classifier: RetryClassifier,
        governor_config: GovernorConfig,
    ) -> Self {
        Self {
            remote,
            templates,
            tags,
            mutator,
            classifier,
            governor_config,
        }
    }

    /// Returns exactly one result per input item. An account-wide failure
    /// fails the account's undecided items and is reported as
    /// `account_error`; other accounts are unaffected.
    #[instrument(skip_all, fields(job_id = ctx.job_id, account_id = %account, items = items.len()))]
    pub async fn process(
        &self,
        account: &str,
        ctx: &JobContext,
        items: Vec<job_item::Model>,
        cancel: &CancellationToken,
    ) -> AccountReport {
        if items.is_empty() {
            return AccountReport::default();
        }
        let started = Instant::now();
        let item_order: Vec<i32> = items.iter().map(|item| item.id).collect();
        let mut outcomes: HashMap<i32, ItemOutcome> = HashMap::with_capacity(items.len());

        let governor = RateGovernor::new(self.governor_config.clone());
        let mut account_error = None;
        if let Err(reason) = self.run(account, ctx, items, cancel, &governor, &mut outcomes).await {
            warn!(account_id = %account, error = %reason, "Account processing aborted");
            for id in &item_order {
                outcomes.entry(*id).or_insert_with(|| ItemOutcome::Failed {
                    reason: reason.message.clone(),
                });
            }
            account_error = Some(format!("account {account}: {}", reason.message));
        }

        histogram!("account_processing_seconds").record(started.elapsed().as_secs_f64());
        let results = item_order
            .into_iter()
            .map(|id| {
                let outcome = outcomes.remove(&id).unwrap_or(ItemOutcome::Deferred);
                ProcessingResult::new(id, outcome)
            })
            .collect();
        AccountReport { results, account_error }
    }

    async fn run(
        &self,
        account: &str,
        ctx: &JobContext,
        items: Vec<job_item::Model>,
        cancel: &CancellationToken,
        governor: &RateGovernor,
        outcomes: &mut HashMap<i32, ItemOutcome>,
    ) -> Result<(), RemoteError> {
        let names = match self.templates.variant_tag(&ctx.variant) {
            Ok(tag) => TagNames::for_variant_tag(&tag),
            Err(err) => return Err(RemoteError::new(err.to_string())),
        };

        let items = self.resolve_parents(account, ctx, items, outcomes).await?;
        if items.is_empty() {
            return Ok(());
        }

        let parent_ids: Vec<String> = items
            .iter()
            .map(|(_, parent_id)| parent_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let (parent_tags, children) = self.prefetch(account, &parent_ids, ctx.query_chunk_size).await?;

        // Build phase: decide skip/fail/create per item.
        let mut planned: Vec<Planned> = Vec::new();
        let mut create_ops: Vec<KeyedOperation> = Vec::new();
        let mut attempted_parents: Vec<(i32, String)> = Vec::new();
        let mut seen_parents: HashMap<String, i32> = HashMap::new();

        for (item, parent_id) in items {
            if let Some(first) = seen_parents.get(&parent_id) {
                outcomes.insert(
                    item.id,
                    ItemOutcome::Skipped {
                        reason: format!("duplicate of item {first} for parent {parent_id}"),
                    },
                );
                continue;
            }
            seen_parents.insert(parent_id.clone(), item.id);

            let carries_done = parent_tags
                .get(&parent_id)
                .is_some_and(|tags| tags.contains(&names.done));
            if carries_done && !ctx.is_repair {
                outcomes.insert(
                    item.id,
                    ItemOutcome::Skipped {
                        reason: format!("already carries {}", names.done),
                    },
                );
                continue;
            }

            let Some(base) = children.get(&parent_id).and_then(|list| list.first()) else {
                outcomes.insert(
                    item.id,
                    ItemOutcome::Skipped {
                        reason: format!("no existing child to base the {} child on", ctx.variant),
                    },
                );
                continue;
            };

            match self.templates.render(&ctx.variant, base) {
                Ok(rendered) => {
                    create_ops.push(KeyedOperation::new(
                        item.id.to_string(),
                        Operation::CreateChild {
                            parent_id: parent_id.clone(),
                            content: rendered.content,
                        },
                    ));
                    planned.push(Planned {
                        item_id: item.id,
                        parent_id,
                        base_child_id: base.id.clone(),
                    });
                }
                Err(TemplateError::MissingFinalUrl) => {
                    outcomes.insert(
                        item.id,
                        ItemOutcome::Skipped {
                            reason: TemplateError::MissingFinalUrl.to_string(),
                        },
                    );
                }
                Err(err) => {
                    outcomes.insert(item.id, ItemOutcome::Failed { reason: err.to_string() });
                    attempted_parents.push((item.id, parent_id));
                }
            }
        }

        debug!(
            planned = planned.len(),
            decided = outcomes.len(),
            "Built create operations"
        );

        let created = self
            .mutator
            .execute(account, create_ops, self.mutator.default_chunk_size(), governor, cancel)
            .await;

        let mut successes: Vec<(&Planned, String)> = Vec::new();
        for plan in &planned {
            let key = plan.item_id.to_string();
            if let Some(child_ref) = created.succeeded.get(&key) {
                successes.push((plan, child_ref.clone()));
            } else if let Some(failure) = created.failed.get(&key) {
                outcomes.insert(
                    plan.item_id,
                    ItemOutcome::Failed {
                        reason: failure.error.clone(),
                    },
                );
                if failure.kind == ErrorKind::Permanent {
                    attempted_parents.push((plan.item_id, plan.parent_id.clone()));
                }
            } else {
                outcomes.insert(plan.item_id, ItemOutcome::Deferred);
            }
        }

        self.tag_results(account, &names, successes, attempted_parents, governor, outcomes)
            .await;
        Ok(())
    }

    /// Fills in missing parent ids with one batched lookup by name.
    async fn resolve_parents(
        &self,
        account: &str,
        ctx: &JobContext,
        items: Vec<job_item::Model>,
        outcomes: &mut HashMap<i32, ItemOutcome>,
    ) -> Result<Vec<(job_item::Model, String)>, RemoteError> {
        let names: Vec<String> = items
            .iter()
            .filter(|item| item.parent_id.is_none())
            .filter_map(|item| item.parent_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut by_name: HashMap<String, Vec<RemoteParent>> = HashMap::new();
        for chunk in names.chunks(ctx.query_chunk_size) {
            let query = ParentQuery::ByNames(chunk.to_vec());
            let found = retry_read(&self.classifier, "search_parents", || {
                self.remote.search_parents(account, &query)
            })
            .await?;
            for parent in found {
                by_name.entry(parent.name.clone()).or_default().push(parent);
            }
        }
        if !names.is_empty() {
            info!(
                requested = names.len(),
                resolved = by_name.len(),
                "Resolved parent ids by name"
            );
        }

        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            if let Some(parent_id) = item.parent_id.clone() {
                resolved.push((item, parent_id));
                continue;
            }
            let Some(name) = item.parent_name.as_deref() else {
                outcomes.insert(
                    item.id,
                    ItemOutcome::Failed {
                        reason: "item has neither a parent id nor a parent name".to_string(),
                    },
                );
                continue;
            };
            let candidates = by_name.get(name).map(Vec::as_slice).unwrap_or_default();
            let matched = candidates
                .iter()
                .find(|parent| {
                    item.campaign_name.is_some() && parent.campaign_name == item.campaign_name
                })
                .or_else(|| candidates.first());
            match matched {
                Some(parent) => {
                    let parent_id = parent.id.clone();
                    resolved.push((item, parent_id));
                }
                None => {
                    outcomes.insert(
                        item.id,
                        ItemOutcome::Skipped {
                            reason: format!("parent '{name}' not found in account {account}"),
                        },
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Parent tag names and children for all parents, one pair of bulk
    /// reads per `chunk_size` parents.
    async fn prefetch(
        &self,
        account: &str,
        parent_ids: &[String],
        chunk_size: usize,
    ) -> Result<(HashMap<String, HashSet<String>>, HashMap<String, Vec<RemoteChild>>), RemoteError> {
        let mut tags: HashMap<String, HashSet<String>> = HashMap::new();
        let mut children: HashMap<String, Vec<RemoteChild>> = HashMap::new();

        for chunk in parent_ids.chunks(chunk_size.max(1)) {
            let (links, found) = tokio::try_join!(
                retry_read(&self.classifier, "parent_tags", || self.remote.parent_tags(account, chunk)),
                retry_read(&self.classifier, "children", || self.remote.children(account, chunk)),
            )?;
            for link in links {
                tags.entry(link.target_id).or_default().insert(link.tag.name);
            }
            for child in found {
                children.entry(child.parent_id.clone()).or_default().push(child);
            }
        }

        debug!(
            parents = parent_ids.len(),
            tagged = tags.len(),
            with_children = children.len(),
            "Prefetched remote state"
        );
        Ok((tags, children))
    }

    /// Tags created children and permanently failed parents. Runs to
    /// completion even when the job is paused, so no created child is left
    /// without its markers.
    async fn tag_results(
        &self,
        account: &str,
        names: &TagNames,
        successes: Vec<(&Planned, String)>,
        attempted: Vec<(i32, String)>,
        governor: &RateGovernor,
        outcomes: &mut HashMap<i32, ItemOutcome>,
    ) {
        if successes.is_empty() && attempted.is_empty() {
            return;
        }

        let mut wanted: Vec<&str> = Vec::new();
        if !successes.is_empty() {
            wanted.extend([names.variant.as_str(), names.done.as_str(), names.original.as_str()]);
        }
        if !attempted.is_empty() {
            wanted.push(names.attempted.as_str());
        }

        let tag_ids = match self.tags.resolve(account, &wanted, governor).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(account_id = %account, error = %err, "Could not resolve tags for created children");
                for (plan, child_ref) in successes {
                    outcomes.insert(
                        plan.item_id,
                        ItemOutcome::Failed {
                            reason: format!("child {child_ref} created but tagging failed: {err}"),
                        },
                    );
                }
                return;
            }
        };
        let tag_id = |name: &str| tag_ids.get(name).cloned().unwrap_or_default();

        let mut ops = Vec::with_capacity(successes.len() * 3 + attempted.len());
        for (plan, child_ref) in &successes {
            ops.push(KeyedOperation::new(
                format!("{}:variant", plan.item_id),
                Operation::AttachTag {
                    target: TagTarget::Child(child_ref.clone()),
                    tag_id: tag_id(&names.variant),
                },
            ));
            ops.push(KeyedOperation::new(
                format!("{}:done", plan.item_id),
                Operation::AttachTag {
                    target: TagTarget::Parent(plan.parent_id.clone()),
                    tag_id: tag_id(&names.done),
                },
            ));
            ops.push(KeyedOperation::new(
                format!("{}:original", plan.item_id),
                Operation::AttachTag {
                    target: TagTarget::Child(plan.base_child_id.clone()),
                    tag_id: tag_id(&names.original),
                },
            ));
        }
        for (item_id, parent_id) in &attempted {
            ops.push(KeyedOperation::new(
                format!("{item_id}:attempted"),
                Operation::AttachTag {
                    target: TagTarget::Parent(parent_id.clone()),
                    tag_id: tag_id(&names.attempted),
                },
            ));
        }

        let report = self
            .mutator
            .execute(
                account,
                ops,
                self.mutator.default_chunk_size(),
                governor,
                &CancellationToken::new(),
            )
            .await;
        apply_tagging_report(&report, successes, outcomes);
    }
}

/// A created child whose parent did not get the done tag is reported as
/// failed: without the tag, discovery would emit it again.
fn apply_tagging_report(
    report: &MutationReport,
    successes: Vec<(&Planned, String)>,
    outcomes: &mut HashMap<i32, ItemOutcome>,
) {
    for (plan, child_ref) in successes {
        let done_key = format!("{}:done", plan.item_id);
        let outcome = match report.failed.get(&done_key) {
            Some(failure) => ItemOutcome::Failed {
                reason: format!("child {child_ref} created but done tag failed: {}", failure.error),
            },
            None => ItemOutcome::Successful { child_ref },
        };
        outcomes.insert(plan.item_id, outcome);
    }

    for (key, failure) in &report.failed {
        if !key.ends_with(":done") {
            warn!(operation = %key, error = %failure.error, "Tag association failed");
        }
    }
}

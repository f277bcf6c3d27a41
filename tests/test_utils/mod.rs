//! Test utilities shared by the integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, a fast
//! engine configuration and `FakeRemote`, an in-memory `RemoteApi` that
//! records calls and can inject scripted failures.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use labelops::accounts::StaticAccounts;
use labelops::config::AppConfig;
use labelops::engine::Engine;
use labelops::ledger::NewItem;
use labelops::models::JobStatus;
use labelops::orchestrator::JobOrchestrator;
use labelops::remote::{
    Operation, OperationResult, ParentQuery, RemoteApi, RemoteChild, RemoteError,
    RemoteOperation, RemoteParent, RemoteTag, TagLink, TagTarget,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::Semaphore;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Defaults with every delay zeroed and small chunks, so multi-chunk paths
/// run in milliseconds.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.governor.initial_delay_seconds = 0.0;
    config.governor.min_delay_seconds = 0.0;
    config.governor.max_delay_seconds = 0.0;
    config.retry.base_delay_seconds = 0.0;
    config.retry.unavailable_base_seconds = 0.0;
    config.retry.conflict_base_seconds = 0.0;
    config.mutator.chunk_size = 10;
    config.mutator.shrink_floor = 2;
    config.ledger.write_batch_size = 25;
    config.orchestrator.account_pacing_ms = 0;
    config.orchestrator.default_query_chunk_size = 50;
    config.auto_queue.cooldown_seconds = 0;
    config.discovery.query_batch_size = 4;
    config.discovery.mutation_batch_size = 3;
    config
}

pub fn build_engine(
    config: &AppConfig,
    db: DatabaseConnection,
    remote: Arc<FakeRemote>,
    accounts: &[&str],
) -> Engine {
    let accounts = StaticAccounts(accounts.iter().map(|a| a.to_string()).collect());
    Engine::build(config, db, remote, Arc::new(accounts)).expect("engine builds with test config")
}

/// Like `build_engine`, through the startup path that recovers stale jobs.
pub async fn start_engine(
    config: &AppConfig,
    db: DatabaseConnection,
    remote: Arc<FakeRemote>,
    accounts: &[&str],
) -> Engine {
    let accounts = StaticAccounts(accounts.iter().map(|a| a.to_string()).collect());
    Engine::start(config, db, remote, Arc::new(accounts))
        .await
        .expect("engine starts with test config")
}

/// Polls `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Polls the ledger until job `job_id` reaches `status`.
pub async fn wait_for_status(
    orchestrator: &JobOrchestrator,
    job_id: i32,
    status: JobStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = orchestrator.ledger().get_job(job_id).await.map(|job| job.status);
        if matches!(current, Ok(s) if s == status) && !orchestrator.is_active(job_id) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One item per parent id, all in `account`.
pub fn items_for(account: &str, parent_ids: &[String], variant: &str) -> Vec<NewItem> {
    parent_ids
        .iter()
        .map(|id| NewItem {
            account_id: account.to_string(),
            parent_id: Some(id.clone()),
            variant: variant.to_string(),
            ..NewItem::default()
        })
        .collect()
}

#[derive(Default)]
struct AccountState {
    parents: Vec<RemoteParent>,
    children: Vec<RemoteChild>,
    tags: Vec<RemoteTag>,
    /// (parent id, tag id)
    parent_links: BTreeSet<(String, String)>,
    /// (child id, tag id)
    child_links: BTreeSet<(String, String)>,
}

impl AccountState {
    fn tag(&self, tag_id: &str) -> Option<RemoteTag> {
        self.tags.iter().find(|t| t.id == tag_id).cloned()
    }

    fn tag_id(&self, name: &str) -> Option<String> {
        self.tags.iter().find(|t| t.name == name).map(|t| t.id.clone())
    }

    fn links(links: &BTreeSet<(String, String)>, ids: &[String], tags: &AccountState) -> Vec<TagLink> {
        links
            .iter()
            .filter(|(target, _)| ids.contains(target))
            .filter_map(|(target, tag_id)| {
                tags.tag(tag_id).map(|tag| TagLink {
                    target_id: target.clone(),
                    tag,
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, AccountState>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    /// Operations received by kind, including rejected ones
    operations: HashMap<&'static str, usize>,
    /// Whole-call failures returned by the next mutate calls
    call_failures: VecDeque<RemoteError>,
    /// Inline failure for any CreateChild under these parents
    rejected_parents: HashMap<String, RemoteError>,
    /// Prefetch reads (`parent_tags`, `children`) of these accounts fail
    failing_accounts: HashMap<String, RemoteError>,
    /// Upcoming `list_tags` calls that answer with an empty list
    stale_tag_listings: usize,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn hit(&mut self, method: &'static str) {
        *self.calls.entry(method).or_default() += 1;
    }

    fn read_failure(&self, account: &str) -> Result<(), RemoteError> {
        match self.failing_accounts.get(account) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory remote. Parents, children and tags live per account.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    create_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Adds parent `id` named `name` with one buildable child `{id}-base`.
    pub fn add_parent(&self, account: &str, id: &str, name: &str) {
        let mut state = self.state();
        let acct = state.accounts.entry(account.to_string()).or_default();
        acct.parents.push(RemoteParent {
            id: id.to_string(),
            name: name.to_string(),
            campaign_id: Some(format!("{account}-campaign")),
            campaign_name: Some("Schoenen".to_string()),
        });
        acct.children.push(base_child(id));
    }

    /// Adds `count` parents `{prefix}{i}` named `Shoes {prefix}{i}`.
    pub fn seed_parents(&self, account: &str, prefix: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let id = format!("{prefix}{i}");
                self.add_parent(account, &id, &format!("Shoes {id}"));
                id
            })
            .collect()
    }

    /// Adds a parent without any child.
    pub fn add_bare_parent(&self, account: &str, id: &str, name: &str) {
        let mut state = self.state();
        state
            .accounts
            .entry(account.to_string())
            .or_default()
            .parents
            .push(RemoteParent {
                id: id.to_string(),
                name: name.to_string(),
                campaign_id: None,
                campaign_name: None,
            });
    }

    /// Defines tag `name` in the account if needed and returns its id.
    pub fn define_tag(&self, account: &str, name: &str) -> String {
        let mut state = self.state();
        if let Some(id) = state
            .accounts
            .get(account)
            .and_then(|acct| acct.tag_id(name))
        {
            return id;
        }
        let id = state.next_id("tag");
        state
            .accounts
            .entry(account.to_string())
            .or_default()
            .tags
            .push(RemoteTag {
                id: id.clone(),
                name: name.to_string(),
            });
        id
    }

    pub fn tag_parent(&self, account: &str, parent_id: &str, tag: &str) {
        let tag_id = self.define_tag(account, tag);
        let mut state = self.state();
        if let Some(acct) = state.accounts.get_mut(account) {
            acct.parent_links.insert((parent_id.to_string(), tag_id));
        }
    }

    pub fn tag_child(&self, account: &str, child_id: &str, tag: &str) {
        let tag_id = self.define_tag(account, tag);
        let mut state = self.state();
        if let Some(acct) = state.accounts.get_mut(account) {
            acct.child_links.insert((child_id.to_string(), tag_id));
        }
    }

    pub fn parent_has_tag(&self, account: &str, parent_id: &str, tag: &str) -> bool {
        let state = self.state();
        let Some(acct) = state.accounts.get(account) else {
            return false;
        };
        let Some(tag_id) = acct.tag_id(tag) else {
            return false;
        };
        acct.parent_links
            .contains(&(parent_id.to_string(), tag_id))
    }

    pub fn child_has_tag(&self, account: &str, child_id: &str, tag: &str) -> bool {
        let state = self.state();
        let Some(acct) = state.accounts.get(account) else {
            return false;
        };
        let Some(tag_id) = acct.tag_id(tag) else {
            return false;
        };
        acct.child_links.contains(&(child_id.to_string(), tag_id))
    }

    pub fn children_of(&self, account: &str, parent_id: &str) -> Vec<RemoteChild> {
        self.state()
            .accounts
            .get(account)
            .map(|acct| {
                acct.children
                    .iter()
                    .filter(|c| c.parent_id == parent_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of calls made to `method` (e.g. `"parent_tags"`).
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    /// Operations of `kind` received (`create_child`, `attach_tag`, ...).
    pub fn operations(&self, kind: &str) -> usize {
        self.state().operations.get(kind).copied().unwrap_or(0)
    }

    pub fn fail_next_mutate(&self, error: RemoteError) {
        self.state().call_failures.push_back(error);
    }

    pub fn reject_children_of(&self, parent_id: &str, error: RemoteError) {
        self.state()
            .rejected_parents
            .insert(parent_id.to_string(), error);
    }

    /// Every prefetch read for `account` fails with `error`.
    pub fn fail_reads_for(&self, account: &str, error: RemoteError) {
        self.state()
            .failing_accounts
            .insert(account.to_string(), error);
    }

    /// The next `list_tags` call misses every tag, as if it ran just before
    /// another writer created them.
    pub fn hide_tags_from_next_listing(&self) {
        self.state().stale_tag_listings += 1;
    }

    /// Every mutate call carrying a CreateChild waits for one permit.
    pub fn gate_creates(&self, gate: Arc<Semaphore>) {
        *self
            .create_gate
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(gate);
    }

    fn apply(state: &mut State, account: &str, op: &RemoteOperation) -> Result<String, RemoteError> {
        let kind = match &op.operation {
            Operation::CreateTag { .. } => "create_tag",
            Operation::CreateChild { .. } => "create_child",
            Operation::AttachTag { .. } => "attach_tag",
            Operation::DetachTag { .. } => "detach_tag",
        };
        *state.operations.entry(kind).or_default() += 1;

        match &op.operation {
            Operation::CreateTag { name } => {
                let id = state.next_id("tag");
                let acct = state.accounts.entry(account.to_string()).or_default();
                if let Some(existing) = acct.tag_id(name) {
                    return Err(RemoteError::with_code(
                        "DUPLICATE_NAME",
                        format!("tag {name} already exists as {existing}"),
                    ));
                }
                acct.tags.push(RemoteTag {
                    id: id.clone(),
                    name: name.clone(),
                });
                Ok(id)
            }
            Operation::CreateChild { parent_id, content } => {
                if let Some(err) = state.rejected_parents.get(parent_id) {
                    return Err(err.clone());
                }
                let id = state.next_id("child");
                let acct = state.accounts.entry(account.to_string()).or_default();
                acct.children.push(RemoteChild {
                    id: id.clone(),
                    parent_id: parent_id.clone(),
                    headlines: content.headlines.clone(),
                    descriptions: content.descriptions.clone(),
                    final_urls: vec![content.final_url.clone()],
                    path1: Some(content.path1.clone()),
                    path2: Some(content.path2.clone()),
                });
                Ok(id)
            }
            Operation::AttachTag { target, tag_id } => {
                let acct = state.accounts.entry(account.to_string()).or_default();
                if acct.tag(tag_id).is_none() {
                    return Err(RemoteError::with_code(
                        "INVALID_ID",
                        format!("unknown tag id '{tag_id}'"),
                    ));
                }
                match target {
                    TagTarget::Parent(id) => acct.parent_links.insert((id.clone(), tag_id.clone())),
                    TagTarget::Child(id) => acct.child_links.insert((id.clone(), tag_id.clone())),
                };
                Ok(format!("{}~{tag_id}", target_id(target)))
            }
            Operation::DetachTag { target, tag_id } => {
                let acct = state.accounts.entry(account.to_string()).or_default();
                let key = (target_id(target).to_string(), tag_id.clone());
                let removed = match target {
                    TagTarget::Parent(_) => acct.parent_links.remove(&key),
                    TagTarget::Child(_) => acct.child_links.remove(&key),
                };
                if !removed {
                    return Err(RemoteError::with_code(
                        "NOT_FOUND",
                        format!("{} does not carry tag {tag_id}", key.0),
                    ));
                }
                Ok(format!("{}~{tag_id}", key.0))
            }
        }
    }
}

fn target_id(target: &TagTarget) -> &str {
    match target {
        TagTarget::Parent(id) | TagTarget::Child(id) => id,
    }
}

fn base_child(parent_id: &str) -> RemoteChild {
    RemoteChild {
        id: format!("{parent_id}-base"),
        parent_id: parent_id.to_string(),
        headlines: vec![
            "Sterke schoenen".to_string(),
            "Gratis verzending".to_string(),
            "Snel in huis".to_string(),
            "Ruim assortiment".to_string(),
        ],
        descriptions: vec![
            "Bestel vandaag nog je nieuwe schoenen online.".to_string(),
            "Voor 22:00 besteld, morgen in huis.".to_string(),
        ],
        final_urls: vec!["https://shop.example.com/schoenen".to_string()],
        path1: Some("schoenen".to_string()),
        path2: Some("heren".to_string()),
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn list_tags(&self, account: &str) -> Result<Vec<RemoteTag>, RemoteError> {
        let mut state = self.state();
        state.hit("list_tags");
        if state.stale_tag_listings > 0 {
            state.stale_tag_listings -= 1;
            return Ok(Vec::new());
        }
        Ok(state
            .accounts
            .get(account)
            .map(|acct| acct.tags.clone())
            .unwrap_or_default())
    }

    async fn search_parents(
        &self,
        account: &str,
        query: &ParentQuery,
    ) -> Result<Vec<RemoteParent>, RemoteError> {
        let mut state = self.state();
        state.hit("search_parents");
        let Some(acct) = state.accounts.get(account) else {
            return Ok(Vec::new());
        };
        let found = match query {
            ParentQuery::NameContains(fragment) => acct
                .parents
                .iter()
                .filter(|p| p.name.contains(fragment.as_str()))
                .cloned()
                .collect(),
            ParentQuery::TaggedWith(name) => {
                let Some(tag_id) = acct.tag_id(name) else {
                    return Ok(Vec::new());
                };
                acct.parents
                    .iter()
                    .filter(|p| acct.parent_links.contains(&(p.id.clone(), tag_id.clone())))
                    .cloned()
                    .collect()
            }
            ParentQuery::ByIds(ids) => acct
                .parents
                .iter()
                .filter(|p| ids.contains(&p.id))
                .cloned()
                .collect(),
            ParentQuery::ByNames(names) => acct
                .parents
                .iter()
                .filter(|p| names.contains(&p.name))
                .cloned()
                .collect(),
        };
        Ok(found)
    }

    async fn parent_tags(
        &self,
        account: &str,
        parent_ids: &[String],
    ) -> Result<Vec<TagLink>, RemoteError> {
        let mut state = self.state();
        state.hit("parent_tags");
        state.read_failure(account)?;
        Ok(state
            .accounts
            .get(account)
            .map(|acct| AccountState::links(&acct.parent_links, parent_ids, acct))
            .unwrap_or_default())
    }

    async fn children(
        &self,
        account: &str,
        parent_ids: &[String],
    ) -> Result<Vec<RemoteChild>, RemoteError> {
        let mut state = self.state();
        state.hit("children");
        state.read_failure(account)?;
        Ok(state
            .accounts
            .get(account)
            .map(|acct| {
                acct.children
                    .iter()
                    .filter(|c| parent_ids.contains(&c.parent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn child_tags(
        &self,
        account: &str,
        child_ids: &[String],
    ) -> Result<Vec<TagLink>, RemoteError> {
        let mut state = self.state();
        state.hit("child_tags");
        Ok(state
            .accounts
            .get(account)
            .map(|acct| AccountState::links(&acct.child_links, child_ids, acct))
            .unwrap_or_default())
    }

    async fn mutate(
        &self,
        account: &str,
        operations: &[RemoteOperation],
    ) -> Result<Vec<OperationResult>, RemoteError> {
        let creates = operations
            .iter()
            .any(|op| matches!(op.operation, Operation::CreateChild { .. }));
        let gate = self
            .create_gate
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        if creates {
            self.state().hit("mutate_create");
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
        }

        let mut state = self.state();
        state.hit("mutate");
        if let Some(err) = state.call_failures.pop_front() {
            return Err(err);
        }
        Ok(operations
            .iter()
            .map(|op| OperationResult {
                id: op.id.clone(),
                outcome: Self::apply(&mut state, account, op),
            })
            .collect())
    }
}

//! Wires the engine components from an `AppConfig`, a database pool, a
//! remote handle and an account source.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::{info, warn};

use crate::accounts::AccountSource;
use crate::auto_queue::AutoQueueScheduler;
use crate::config::AppConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::EngineError;
use crate::ledger::ItemLedger;
use crate::mutator::ChunkedMutator;
use crate::orchestrator::JobOrchestrator;
use crate::processor::AccountProcessor;
use crate::remote::RemoteApi;
use crate::retry::RetryClassifier;
use crate::tags::TagCache;
use crate::templates::{TemplateProvider, ThemeCatalog};

pub struct Engine {
    pub orchestrator: JobOrchestrator,
    pub discovery: DiscoveryEngine,
    pub auto_queue: AutoQueueScheduler,
}

impl Engine {
    /// Builds the engine and fails every job a previous process left
    /// `running`. Use this at process startup; `build` skips the recovery.
    pub async fn start(
        config: &AppConfig,
        db: DatabaseConnection,
        remote: Arc<dyn RemoteApi>,
        accounts: Arc<dyn AccountSource>,
    ) -> Result<Self, EngineError> {
        let engine = Self::build(config, db, remote, accounts)?;
        let recovered = engine.orchestrator.recover_stale_jobs().await?;
        if recovered > 0 {
            warn!(recovered, "Failed jobs left running by a previous process");
        }
        info!("Engine started");
        Ok(engine)
    }

    /// Builds the engine with the built-in theme catalog. Does not touch
    /// stale `running` jobs; see [`Engine::start`].
    pub fn build(
        config: &AppConfig,
        db: DatabaseConnection,
        remote: Arc<dyn RemoteApi>,
        accounts: Arc<dyn AccountSource>,
    ) -> Result<Self, EngineError> {
        let templates: Arc<dyn TemplateProvider> = Arc::new(ThemeCatalog::new(config.templates.clone())?);
        Ok(Self::with_templates(config, db, remote, accounts, templates))
    }

    pub fn with_templates(
        config: &AppConfig,
        db: DatabaseConnection,
        remote: Arc<dyn RemoteApi>,
        accounts: Arc<dyn AccountSource>,
        templates: Arc<dyn TemplateProvider>,
    ) -> Self {
        let classifier = RetryClassifier::new(config.retry.clone(), config.mutator.shrink_floor);
        let mutator = ChunkedMutator::new(remote.clone(), classifier.clone(), config.mutator.clone());
        let tags = Arc::new(TagCache::new(remote.clone(), classifier.clone(), mutator.clone()));
        let ledger = ItemLedger::new(db, config.ledger.write_batch_size);

        let processor = AccountProcessor::new(
            remote.clone(),
            templates.clone(),
            tags.clone(),
            mutator.clone(),
            classifier.clone(),
            config.governor.clone(),
        );
        let orchestrator = JobOrchestrator::new(
            ledger,
            processor,
            templates.clone(),
            config.orchestrator.clone(),
        );
        let discovery = DiscoveryEngine::new(
            remote,
            templates,
            accounts,
            orchestrator.clone(),
            mutator,
            tags,
            classifier,
            config.governor.clone(),
            config.discovery.clone(),
        );
        let auto_queue = AutoQueueScheduler::new(orchestrator.clone(), &config.auto_queue);

        Self {
            orchestrator,
            discovery,
            auto_queue,
        }
    }
}

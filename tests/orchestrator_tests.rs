//! End-to-end job execution against the in-memory remote.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use labelops::error::EngineError;
use labelops::ledger::{ItemUpdate, NewItem};
use labelops::models::{ItemStatus, JobSource, JobStatus};
use labelops::orchestrator::{JobCompletion, JobOptions, STALE_JOB_MESSAGE};
use labelops::remote::RemoteError;
use tokio::sync::Semaphore;

use test_utils::{
    FakeRemote, build_engine, items_for, setup_test_db, start_engine, test_config, wait_until,
};

const ACCOUNT: &str = "1234567890";
const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn job_creates_children_tags_them_and_completes() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 12);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;
    let mut completions = orchestrator.subscribe_completions();

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "BF"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.variant, "black_friday");
    assert_eq!(report.successful, 12);
    assert_eq!(report.pending, 0);
    assert_eq!(remote.operations("create_child"), 12);

    for parent in &parents {
        assert!(remote.parent_has_tag(ACCOUNT, parent, "THEME_BF_DONE"));
        assert!(remote.child_has_tag(ACCOUNT, &format!("{parent}-base"), "THEMA_ORIGINAL"));
        let children = remote.children_of(ACCOUNT, parent);
        assert_eq!(children.len(), 2);
        assert!(remote.child_has_tag(ACCOUNT, &children[1].id, "THEME_BF"));
    }

    let items = orchestrator
        .list_items(job_id, Some(ItemStatus::Successful))
        .await
        .unwrap();
    assert!(items.iter().all(|item| item.child_ref.is_some()));

    assert_eq!(
        completions.recv().await,
        Some(JobCompletion {
            job_id,
            status: JobStatus::Completed
        })
    );
}

#[tokio::test]
async fn done_parents_are_skipped_unless_repair() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 4);
    remote.tag_parent(ACCOUNT, &parents[0], "THEME_BF_DONE");
    remote.tag_parent(ACCOUNT, &parents[1], "THEME_BF_DONE");
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!((report.successful, report.skipped), (2, 2));
    let skipped = orchestrator
        .list_items(job_id, Some(ItemStatus::Skipped))
        .await
        .unwrap();
    assert!(
        skipped
            .iter()
            .all(|item| item.error_message.as_deref() == Some("already carries THEME_BF_DONE"))
    );

    let repair_id = orchestrator
        .create_job(
            items_for(ACCOUNT, &parents[..2], "black_friday"),
            JobOptions {
                is_repair: true,
                source: JobSource::Reconciliation,
                query_chunk_size: None,
            },
        )
        .await
        .unwrap();
    orchestrator.start_job(repair_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(repair_id).await.unwrap();
    assert!(report.is_repair);
    assert_eq!((report.successful, report.skipped), (2, 0));
    assert_eq!(remote.operations("create_child"), 4);
}

#[tokio::test]
async fn resume_dispatches_only_pending_items() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 100);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;
    let ledger = orchestrator.ledger().clone();

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();

    // A previous pass recorded 40 results before being paused.
    assert!(
        ledger
            .jobs()
            .transition(job_id, &[JobStatus::Pending], JobStatus::Paused, None)
            .await
            .unwrap()
    );
    let pending = ledger.get_pending_items(job_id).await.unwrap();
    let done: Vec<ItemUpdate> = pending[..40]
        .iter()
        .map(|item| ItemUpdate {
            item_id: item.id,
            status: ItemStatus::Successful,
            child_ref: Some(format!("earlier-{}", item.id)),
            message: None,
        })
        .collect();
    ledger.record_results(job_id, &done).await.unwrap();

    orchestrator.resume_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.successful, 100);
    assert_eq!(remote.operations("create_child"), 60);
}

#[tokio::test]
async fn pause_stops_dispatch_and_resume_finishes_the_rest() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 30);
    let gate = Arc::new(Semaphore::new(0));
    remote.gate_creates(gate.clone());
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();
    let handle = orchestrator.start_job(job_id).await.unwrap();

    assert!(wait_until(TIMEOUT, || remote.calls("mutate_create") >= 1).await);
    orchestrator.pause_job(job_id).await.unwrap();
    gate.add_permits(1000);
    handle.await.unwrap();

    // The in-flight chunk of 10 finished and was recorded; nothing else ran.
    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Paused);
    assert_eq!(report.successful, 10);
    assert_eq!(report.pending, 20);
    assert_eq!(remote.operations("create_child"), 10);
    assert!(!orchestrator.is_active(job_id));

    orchestrator.resume_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.successful, 30);
    assert_eq!(remote.operations("create_child"), 30);
}

#[tokio::test]
async fn prefetch_reads_one_batch_per_query_chunk() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 120);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(
            items_for(ACCOUNT, &parents, "kerst"),
            JobOptions {
                query_chunk_size: Some(50),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    assert_eq!(remote.calls("parent_tags"), 3);
    assert_eq!(remote.calls("children"), 3);
    // Tags are listed once, then served from the cache.
    assert_eq!(remote.calls("list_tags"), 1);
    assert_eq!(orchestrator.job_status(job_id).await.unwrap().successful, 120);
}

#[tokio::test]
async fn mixed_outcomes_keep_counters_consistent() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 8);
    remote.add_bare_parent(ACCOUNT, "bare", "Shoes bare");
    remote.tag_parent(ACCOUNT, &parents[0], "THEME_SK_DONE");
    let rejection = RemoteError::with_code("POLICY_FINDING", "Ad text contains prohibited content");
    remote.reject_children_of(&parents[1], rejection.clone());
    remote.reject_children_of(&parents[2], rejection);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let mut ids = parents.clone();
    ids.push("bare".to_string());
    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &ids, "sint"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        (report.successful, report.failed, report.skipped),
        (5, 2, 2)
    );
    assert_eq!(
        report.successful + report.failed + report.skipped + report.pending,
        report.total
    );
    assert!(
        report
            .recent_failures
            .iter()
            .all(|f| f.error.as_deref() == Some("Ad text contains prohibited content"))
    );

    let counts = orchestrator.ledger().items().count_by_status(job_id).await.unwrap();
    assert_eq!(counts.get(&ItemStatus::Successful).copied().unwrap_or(0), 5);
    assert_eq!(counts.get(&ItemStatus::Failed).copied().unwrap_or(0), 2);
    assert_eq!(counts.get(&ItemStatus::Skipped).copied().unwrap_or(0), 2);

    // Permanently rejected parents are marked attempted so discovery skips them.
    assert!(remote.parent_has_tag(ACCOUNT, &parents[1], "THEME_SK_ATTEMPTED"));
    assert!(remote.parent_has_tag(ACCOUNT, &parents[2], "THEME_SK_ATTEMPTED"));
    assert!(!remote.parent_has_tag(ACCOUNT, &parents[3], "THEME_SK_ATTEMPTED"));
}

#[tokio::test]
async fn throughput_failure_is_retried_without_losing_items() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 5);
    remote.fail_next_mutate(RemoteError::with_code("RESOURCE_EXHAUSTED", "Too many requests"));
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "cm"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.successful, 5);
    assert_eq!(remote.calls("mutate_create"), 2);
}

#[tokio::test]
async fn parents_are_resolved_by_name_with_campaign_preference() {
    let remote = FakeRemote::new();
    remote.add_parent(ACCOUNT, "a1", "Sneakers");
    remote.add_parent(ACCOUNT, "a2", "Boots");
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let items = vec![
        NewItem {
            account_id: ACCOUNT.to_string(),
            parent_name: Some("Sneakers".to_string()),
            campaign_name: Some("Schoenen".to_string()),
            variant: "singles".to_string(),
            ..NewItem::default()
        },
        NewItem {
            account_id: ACCOUNT.to_string(),
            parent_name: Some("Sandals".to_string()),
            variant: "singles".to_string(),
            ..NewItem::default()
        },
    ];
    let job_id = orchestrator.create_job(items, JobOptions::default()).await.unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!((report.successful, report.skipped), (1, 1));
    assert_eq!(remote.calls("search_parents"), 1);
    assert!(remote.parent_has_tag(ACCOUNT, "a1", "THEME_SD_DONE"));
    assert!(!remote.parent_has_tag(ACCOUNT, "a2", "THEME_SD_DONE"));
}

#[tokio::test]
async fn stale_running_job_is_failed_and_resumable() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 3);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();
    // Left running by a process that died.
    assert!(
        orchestrator
            .ledger()
            .jobs()
            .claim(job_id, &[JobStatus::Pending])
            .await
            .unwrap()
    );

    assert_eq!(orchestrator.recover_stale_jobs().await.unwrap(), 1);
    let job = orchestrator.ledger().get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.is_some());

    orchestrator.resume_job(job_id).await.unwrap().await.unwrap();
    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.successful, 3);
}

#[tokio::test]
async fn engine_startup_fails_jobs_left_running() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 2);
    let db = setup_test_db().await.unwrap();

    let crashed = build_engine(&test_config(), db.clone(), remote.clone(), &[ACCOUNT]);
    let job_id = crashed
        .orchestrator
        .create_job(items_for(ACCOUNT, &parents, "sinterklaas"), JobOptions::default())
        .await
        .unwrap();
    assert!(
        crashed
            .orchestrator
            .ledger()
            .jobs()
            .claim(job_id, &[JobStatus::Pending])
            .await
            .unwrap()
    );
    drop(crashed);

    let engine = start_engine(&test_config(), db, remote, &[ACCOUNT]).await;
    let job = engine.orchestrator.ledger().get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(STALE_JOB_MESSAGE));
    assert_eq!(job.pending_items(), 2);
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 2);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        orchestrator.resume_job(job_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        orchestrator.pause_job(job_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    orchestrator.start_job(job_id).await.unwrap().await.unwrap();
    assert!(matches!(
        orchestrator.start_job(job_id).await,
        Err(EngineError::InvalidTransition {
            from: JobStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn delete_refuses_running_jobs() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 2);
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();
    orchestrator
        .ledger()
        .jobs()
        .claim(job_id, &[JobStatus::Pending])
        .await
        .unwrap();
    assert!(matches!(
        orchestrator.delete_job(job_id).await,
        Err(EngineError::JobRunning(id)) if id == job_id
    ));

    orchestrator.recover_stale_jobs().await.unwrap();
    orchestrator.delete_job(job_id).await.unwrap();
    assert!(orchestrator.list_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_job_validates_before_writing() {
    let remote = FakeRemote::new();
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote, &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let unknown = items_for(ACCOUNT, &["p1".to_string()], "easter");
    assert!(matches!(
        orchestrator.create_job(unknown, JobOptions::default()).await,
        Err(EngineError::InvalidInput(_))
    ));

    let mut mixed = items_for(ACCOUNT, &["p1".to_string()], "black_friday");
    mixed.extend(items_for(ACCOUNT, &["p2".to_string()], "kerstmis"));
    assert!(matches!(
        orchestrator.create_job(mixed, JobOptions::default()).await,
        Err(EngineError::InvalidInput(_))
    ));

    let anonymous = vec![NewItem {
        account_id: ACCOUNT.to_string(),
        variant: "black_friday".to_string(),
        ..NewItem::default()
    }];
    assert!(matches!(
        orchestrator.create_job(anonymous, JobOptions::default()).await,
        Err(EngineError::InvalidInput(_))
    ));

    assert!(matches!(
        orchestrator.create_job(Vec::new(), JobOptions::default()).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(orchestrator.list_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn aborted_account_is_reported_while_other_accounts_finish() {
    const HEALTHY: &str = "1111111111";
    const DISABLED: &str = "2222222222";
    let remote = FakeRemote::new();
    let healthy = remote.seed_parents(HEALTHY, "h", 3);
    let disabled = remote.seed_parents(DISABLED, "d", 3);
    remote.fail_reads_for(
        DISABLED,
        RemoteError::with_code("CUSTOMER_NOT_ENABLED", "The customer account can't be accessed because it is not yet enabled or has been deactivated."),
    );
    let engine = build_engine(
        &test_config(),
        setup_test_db().await.unwrap(),
        remote.clone(),
        &[HEALTHY, DISABLED],
    );
    let orchestrator = engine.orchestrator;

    let mut items = items_for(HEALTHY, &healthy, "black_friday");
    items.extend(items_for(DISABLED, &disabled, "black_friday"));
    let job_id = orchestrator.create_job(items, JobOptions::default()).await.unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!((report.successful, report.failed, report.pending), (3, 3, 0));
    let last_error = report.last_error.expect("aborted account is recorded on the job");
    assert!(last_error.contains(DISABLED));
    assert!(last_error.contains("not yet enabled"));

    for parent in &healthy {
        assert!(remote.parent_has_tag(HEALTHY, parent, "THEME_BF_DONE"));
    }
    let failed = orchestrator
        .list_items(job_id, Some(ItemStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|item| item.account_id == DISABLED));
}

#[tokio::test]
async fn job_fails_when_every_account_aborts() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 4);
    remote.fail_reads_for(ACCOUNT, RemoteError::with_code("PERMISSION_DENIED", "User doesn't have permission to access customer."));
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;
    let mut completions = orchestrator.subscribe_completions();

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "cyber_monday"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.failed, 4);
    assert!(
        report
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("doesn't have permission"))
    );
    assert_eq!(remote.operations("create_child"), 0);
    assert_eq!(
        completions.recv().await,
        Some(JobCompletion {
            job_id,
            status: JobStatus::Failed
        })
    );
}

#[tokio::test]
async fn tags_created_by_another_writer_are_adopted() {
    let remote = FakeRemote::new();
    let parents = remote.seed_parents(ACCOUNT, "p", 3);
    for tag in ["THEME_BF", "THEME_BF_DONE", "THEMA_ORIGINAL"] {
        remote.define_tag(ACCOUNT, tag);
    }
    // The listing predates the other writer's tags, so creation collides.
    remote.hide_tags_from_next_listing();
    let engine = build_engine(&test_config(), setup_test_db().await.unwrap(), remote.clone(), &[ACCOUNT]);
    let orchestrator = engine.orchestrator;

    let job_id = orchestrator
        .create_job(items_for(ACCOUNT, &parents, "black_friday"), JobOptions::default())
        .await
        .unwrap();
    orchestrator.start_job(job_id).await.unwrap().await.unwrap();

    let report = orchestrator.job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!((report.successful, report.failed), (3, 0));
    assert_eq!(remote.operations("create_tag"), 3);
    assert_eq!(remote.calls("list_tags"), 2);
    for parent in &parents {
        assert!(remote.parent_has_tag(ACCOUNT, parent, "THEME_BF_DONE"));
        assert!(remote.child_has_tag(ACCOUNT, &format!("{parent}-base"), "THEMA_ORIGINAL"));
    }
}

//! Planner filtering: disabled rows, unconfigured connectors, run-policy
//! deferrals, forced and scoped requests, and sentinel selection when
//! nothing is runnable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use sspm_lock::{LeaseLockConfig, LeaseLockManager, LockManager};
use sspm_store::{RunStatus, Store, SyncStats};
use sspm_sync::{
    is_no_connectors_due, is_no_enabled_connectors, ConnectorDefinition, DbRunner, EvalMode,
    NullReporter, Role, RunMode, RunPolicy, RunRequest, Runner, TriggerRequest,
};
use sspm_testkit::{MemStore, ScriptedDefinition, ScriptedIntegration};

fn runner(
    store: Arc<MemStore>,
    registry: Vec<Arc<dyn ConnectorDefinition>>,
) -> DbRunner {
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store.clone(),
        LeaseLockConfig::default(),
    ));
    DbRunner::new(
        store,
        locks,
        registry,
        RunPolicy::default(),
        Arc::new(NullReporter),
        None,
        EvalMode::BestEffort,
        RunMode::Full,
    )
}

fn counting_definition(kind: &'static str, name: &'static str) -> (Arc<dyn ConnectorDefinition>, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in_def = runs.clone();
    let def = Arc::new(ScriptedDefinition::new(kind, Role::App, true, move |_cfg| {
        let runs = runs_in_def.clone();
        Ok(Box::new(ScriptedIntegration::new(
            kind,
            name,
            Role::App,
            move |_deps| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )))
    }));
    (def, runs)
}

fn scheduled() -> RunRequest {
    RunRequest::scheduled(CancellationToken::new())
}

#[tokio::test]
async fn no_configs_is_no_enabled_connectors() {
    let store = Arc::new(MemStore::new());
    let (def, _) = counting_definition("okta", "acme");
    let err = runner(store, vec![def]).run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_enabled_connectors(&err));
}

#[tokio::test]
async fn disabled_rows_are_excluded() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", false, json!({}));
    let (def, runs) = counting_definition("okta", "acme");
    let err = runner(store, vec![def]).run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_enabled_connectors(&err));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn enabled_connector_with_no_history_runs() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", true, json!({}));
    let (def, runs) = counting_definition("okta", "acme");
    runner(store, vec![def]).run_once(&scheduled()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recent_success_defers_and_forced_bypasses() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", true, json!({}));

    // A success just now: the default 1h interval gate defers the next run.
    let run_id = store.create_sync_run("okta", "acme").await.unwrap();
    store
        .mark_sync_run_success(run_id, &SyncStats::new(1))
        .await
        .unwrap();

    let (def, runs) = counting_definition("okta", "acme");
    let db_runner = runner(store.clone(), vec![def]);

    let err = db_runner.run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_connectors_due(&err), "expected deferral, got {err:#}");
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Forced requests bypass the policy entirely.
    db_runner
        .run_once(&RunRequest::forced(None, CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_backoff_defers_scheduled_runs() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", true, json!({}));

    let run_id = store.create_sync_run("okta", "acme").await.unwrap();
    store
        .fail_sync_run(run_id, RunStatus::Error, "vendor 500", "api")
        .await
        .unwrap();

    let (def, runs) = counting_definition("okta", "acme");
    let err = runner(store, vec![def]).run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_connectors_due(&err));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scope_filters_by_kind_and_case_insensitive_name() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", true, json!({}));
    store.set_connector_config("github", true, json!({}));

    let (okta_def, okta_runs) = counting_definition("okta", "Acme.okta.com");
    let (github_def, github_runs) = counting_definition("github", "acme");
    let db_runner = runner(store, vec![okta_def, github_def]);

    let scope = TriggerRequest::normalized("OKTA", "acme.OKTA.com");
    db_runner
        .run_once(&RunRequest::forced(scope, CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(okta_runs.load(Ordering::SeqCst), 1);
    assert_eq!(github_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scoped_miss_is_no_connectors_due() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("okta", true, json!({}));
    let (def, _) = counting_definition("okta", "acme");

    let scope = TriggerRequest::normalized("okta", "other-tenant");
    let err = runner(store, vec![def])
        .run_once(&RunRequest::forced(scope, CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(is_no_connectors_due(&err));
}

#[tokio::test]
async fn unknown_kind_joins_error_with_no_enabled() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("mystery", true, json!({}));

    let (def, _) = counting_definition("okta", "acme");
    let err = runner(store, vec![def]).run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_enabled_connectors(&err));
    assert!(format!("{err:#}").contains("mystery"));
}

#[tokio::test]
async fn unsupported_mode_is_filtered() {
    let store = Arc::new(MemStore::new());
    store.set_connector_config("github", true, json!({}));

    // ScriptedIntegration defaults to full-only; a discovery planner must
    // filter it out.
    let (def, runs) = counting_definition("github", "acme");
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store.clone(),
        LeaseLockConfig::default(),
    ));
    let discovery_runner = DbRunner::new(
        store,
        locks,
        vec![def],
        RunPolicy::default(),
        Arc::new(NullReporter),
        None,
        EvalMode::BestEffort,
        RunMode::Discovery,
    );

    let err = discovery_runner.run_once(&scheduled()).await.unwrap_err();
    assert!(is_no_enabled_connectors(&err));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

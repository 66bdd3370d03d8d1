//! One connector's API failure must not abort its peers: the failing run
//! records `error/api`, the healthy peer finishes (including its expire
//! phase), and the pass returns the joined failure.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sspm_connectors::lifecycle::{RunLifecycle, TagErr};
use sspm_lock::{LeaseLockConfig, LeaseLockManager, LockManager};
use sspm_store::{AppUserRecord, EntityClass, RunStatus, Store};
use sspm_sync::{EvalMode, Integration, IntegrationDeps, Orchestrator, Role, RunMode};
use sspm_testkit::MemStore;

/// Fails its vendor pull after the run row exists.
struct FailingIntegration;

#[async_trait]
impl Integration for FailingIntegration {
    fn kind(&self) -> &str {
        "datadog"
    }

    fn name(&self) -> &str {
        "acme.datadoghq.com"
    }

    fn role(&self) -> Role {
        Role::App
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let err = Err::<(), _>(anyhow!("403 forbidden: bad app key"))
            .tag_api()
            .unwrap_err();
        run.record_failure(&err).await;
        Err(err)
    }
}

/// Upserts one user and finalizes cleanly.
struct HealthyIntegration;

#[async_trait]
impl Integration for HealthyIntegration {
    fn kind(&self) -> &str {
        "github"
    }

    fn name(&self) -> &str {
        "acme"
    }

    fn role(&self) -> Role {
        Role::App
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let res = async {
            deps.store
                .upsert_app_users_bulk_by_source(
                    "github",
                    "acme",
                    run.run_id(),
                    &[AppUserRecord {
                        external_id: "octocat".to_string(),
                        email: Some("octocat@acme.com".to_string()),
                        display_name: Some("octocat".to_string()),
                        status: None,
                        is_admin: false,
                    }],
                )
                .await
                .tag_db()?;
            run.touch(EntityClass::AppUsers);
            Ok(())
        }
        .await;
        match res {
            Ok(()) => {
                run.finalize().await?;
                Ok(())
            }
            Err(err) => {
                run.record_failure(&err).await;
                Err(err)
            }
        }
    }
}

#[tokio::test]
async fn failing_connector_leaves_peer_untouched() {
    let store = Arc::new(MemStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store_dyn.clone(),
        LeaseLockConfig::default(),
    ));

    // Seed a previously-live github user that this pass will not observe,
    // proving the peer's expire phase ran.
    store
        .upsert_app_users_bulk_by_source(
            "github",
            "acme",
            1,
            &[AppUserRecord {
                external_id: "departed".to_string(),
                email: None,
                display_name: None,
                status: None,
                is_admin: false,
            }],
        )
        .await
        .unwrap();
    store
        .promote_seen_in_run(EntityClass::AppUsers, 1, "github", "acme")
        .await
        .unwrap();

    let mut orchestrator = Orchestrator::new(store_dyn, locks);
    orchestrator.set_run_mode(RunMode::Full);
    orchestrator.set_global_eval_mode(EvalMode::BestEffort);
    orchestrator
        .add_integration(Arc::new(FailingIntegration))
        .unwrap();
    orchestrator
        .add_integration(Arc::new(HealthyIntegration))
        .unwrap();

    let err = orchestrator
        .run_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("bad app key"),
        "pass error must carry the failing connector's cause: {err:#}"
    );

    let runs = store.sync_runs();
    let datadog_run = runs
        .iter()
        .find(|r| r.source_kind == "datadog")
        .expect("datadog run row");
    assert_eq!(datadog_run.status, RunStatus::Error);
    assert_eq!(datadog_run.error_kind.as_deref(), Some("api"));

    let github_run = runs
        .iter()
        .find(|r| r.source_kind == "github")
        .expect("github run row");
    assert_eq!(github_run.status, RunStatus::Success);
    let counts = &github_run.stats["counts"]["app_users"];
    assert_eq!(counts["observed"], 1);
    assert_eq!(counts["expired"], 1);

    // Row-level proof: the departed user is soft-deleted, the observed one
    // is live.
    let users = store.app_users_snapshot("github", "acme");
    let departed = users
        .iter()
        .find(|u| u.record.external_id == "departed")
        .unwrap();
    assert!(departed.expired_at.is_some());
    let octocat = users
        .iter()
        .find(|u| u.record.external_id == "octocat")
        .unwrap();
    assert!(octocat.expired_at.is_none());
}

//! A lease stolen mid-run: the heartbeat renew fails, the managed-lock
//! helper cancels the run's token, the connector returns the cancellation,
//! and the run row lands as `canceled` / `context_canceled`. The
//! orchestrator surfaces the lost lease as non-retryable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sspm_connectors::lifecycle::{check_cancel, RunLifecycle};
use sspm_lock::{
    connector_scope_name, LeaseLockConfig, LeaseLockManager, LockManager, SCOPE_KIND_CONNECTOR,
};
use sspm_store::{RunStatus, Store};
use sspm_sync::{is_lock_lost, Integration, IntegrationDeps, Orchestrator, Role, RunMode};
use sspm_testkit::MemStore;

/// Spins until its token is canceled, then reports the cancellation through
/// the normal failure path.
struct LongRunningIntegration;

#[async_trait]
impl Integration for LongRunningIntegration {
    fn kind(&self) -> &str {
        "vault"
    }

    fn name(&self) -> &str {
        "vault.acme.dev"
    }

    fn role(&self) -> Role {
        Role::App
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;

        // Bounded wait so a broken heartbeat cannot hang the suite.
        let res = async {
            for _ in 0..200 {
                check_cancel(&deps.cancel)?;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
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
async fn stolen_lease_cancels_run_and_records_canceled() {
    let store = Arc::new(MemStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store_dyn.clone(),
        LeaseLockConfig {
            ttl: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(120),
        },
    ));

    let mut orchestrator = Orchestrator::new(store_dyn, locks);
    orchestrator.set_run_mode(RunMode::Full);
    orchestrator
        .add_integration(Arc::new(LongRunningIntegration))
        .unwrap();

    let scope = connector_scope_name("vault", "vault.acme.dev");
    let thief = {
        let store = store.clone();
        tokio::spawn(async move {
            // Let the run start and take its lease, then steal it.
            tokio::time::sleep(Duration::from_millis(200)).await;
            store.steal_lease(SCOPE_KIND_CONNECTOR, &scope);
        })
    };

    let err = orchestrator
        .run_once(&CancellationToken::new())
        .await
        .unwrap_err();
    thief.await.unwrap();

    assert!(
        is_lock_lost(&err),
        "pass error must carry the lost-lease sentinel: {err:#}"
    );

    let runs = store.sync_runs();
    let run = runs.iter().find(|r| r.source_kind == "vault").unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.error_kind.as_deref(), Some("context_canceled"));
}

//! Terminal run classification: vendor failures record `error/api`, a
//! canceled pass records `canceled/context_canceled`, and the failure row
//! lands even though the run errored mid-flight.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use sspm_connectors::okta::{
    OktaApi, OktaApp, OktaAppAssignment, OktaConfig, OktaGroup, OktaIntegration, OktaLogEvent,
    OktaUser,
};
use sspm_connectors::Page;
use sspm_store::RunStatus;
use sspm_sync::{Integration, IntegrationDeps, NullReporter, RunMode};
use sspm_testkit::MemStore;

struct ExplodingOkta;

#[async_trait]
impl OktaApi for ExplodingOkta {
    async fn list_users(&self, _after: Option<&str>) -> Result<Page<OktaUser>> {
        Err(anyhow!("okta api returned 401: token revoked"))
    }

    async fn list_groups(&self, _after: Option<&str>) -> Result<Page<OktaGroup>> {
        Ok(Page::last(vec![]))
    }

    async fn list_apps(&self, _after: Option<&str>) -> Result<Page<OktaApp>> {
        Ok(Page::last(vec![]))
    }

    async fn list_app_assignments(
        &self,
        _app_id: &str,
        _after: Option<&str>,
    ) -> Result<Page<OktaAppAssignment>> {
        Ok(Page::last(vec![]))
    }

    async fn list_system_log(
        &self,
        _since: DateTime<Utc>,
        _after: Option<&str>,
    ) -> Result<Page<OktaLogEvent>> {
        Ok(Page::last(vec![]))
    }
}

fn integration(api: Arc<dyn OktaApi>) -> OktaIntegration {
    OktaIntegration::new(
        OktaConfig {
            domain: "acme.okta.com".to_string(),
            api_token: "tok".to_string(),
        },
        api,
    )
}

#[tokio::test]
async fn vendor_failure_records_api_error() {
    let store = Arc::new(MemStore::new());
    let deps = IntegrationDeps {
        store: store.clone(),
        reporter: Arc::new(NullReporter),
        mode: RunMode::Full,
        cancel: CancellationToken::new(),
    };

    let err = integration(Arc::new(ExplodingOkta))
        .run(&deps)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("token revoked"));

    let runs = store.sync_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert_eq!(runs[0].error_kind.as_deref(), Some("api"));
    assert!(runs[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("token revoked"));
}

#[tokio::test]
async fn pre_canceled_pass_records_context_canceled() {
    let store = Arc::new(MemStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let deps = IntegrationDeps {
        store: store.clone(),
        reporter: Arc::new(NullReporter),
        mode: RunMode::Full,
        cancel,
    };

    let err = integration(Arc::new(ExplodingOkta))
        .run(&deps)
        .await
        .unwrap_err();
    assert!(sspm_sync::is_canceled(&err));

    let runs = store.sync_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Canceled);
    assert_eq!(runs[0].error_kind.as_deref(), Some("context_canceled"));
}

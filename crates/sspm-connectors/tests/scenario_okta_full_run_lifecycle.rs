//! Okta full run over a scripted API: paged pulls, batched upserts, and the
//! promote/expire finalize, including the property that a later run
//! expires rows it no longer observes while other sources stay untouched.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use sspm_connectors::okta::{
    OktaApi, OktaApp, OktaAppAssignment, OktaConfig, OktaGroup, OktaIntegration, OktaLogEvent,
    OktaUser,
};
use sspm_connectors::Page;
use sspm_store::{IdpUserRecord, RunStatus, Store};
use sspm_sync::{Integration, IntegrationDeps, NullReporter, RunMode};
use sspm_testkit::MemStore;

struct ScriptedOkta {
    users: Vec<Vec<OktaUser>>,
}

fn user(id: &str, email: &str) -> OktaUser {
    OktaUser {
        id: id.to_string(),
        email: Some(email.to_string()),
        display_name: Some(id.to_string()),
        status: Some("ACTIVE".to_string()),
    }
}

#[async_trait]
impl OktaApi for ScriptedOkta {
    async fn list_users(&self, after: Option<&str>) -> Result<Page<OktaUser>> {
        let idx: usize = after.map(|a| a.parse().unwrap()).unwrap_or(0);
        let items = self.users.get(idx).cloned().unwrap_or_default();
        let next = (idx + 1 < self.users.len()).then(|| (idx + 1).to_string());
        Ok(Page { items, next })
    }

    async fn list_groups(&self, _after: Option<&str>) -> Result<Page<OktaGroup>> {
        Ok(Page::last(vec![OktaGroup {
            id: "g-eng".to_string(),
            name: "Engineering".to_string(),
            description: None,
        }]))
    }

    async fn list_apps(&self, _after: Option<&str>) -> Result<Page<OktaApp>> {
        Ok(Page::last(vec![OktaApp {
            id: "0oa-figma".to_string(),
            label: "Figma".to_string(),
            sign_on_mode: Some("SAML_2_0".to_string()),
        }]))
    }

    async fn list_app_assignments(
        &self,
        _app_id: &str,
        _after: Option<&str>,
    ) -> Result<Page<OktaAppAssignment>> {
        Ok(Page::last(vec![
            OktaAppAssignment {
                user_id: "u1".to_string(),
                scope: "USER".to_string(),
                group_id: None,
            },
            OktaAppAssignment {
                user_id: "u2".to_string(),
                scope: "GROUP".to_string(),
                group_id: Some("g-eng".to_string()),
            },
        ]))
    }

    async fn list_system_log(
        &self,
        _since: DateTime<Utc>,
        _after: Option<&str>,
    ) -> Result<Page<OktaLogEvent>> {
        Ok(Page::last(Vec::new()))
    }
}

fn integration(users: Vec<Vec<OktaUser>>) -> OktaIntegration {
    OktaIntegration::new(
        OktaConfig {
            domain: "acme.okta.com".to_string(),
            api_token: "tok".to_string(),
        },
        Arc::new(ScriptedOkta { users }),
    )
}

fn deps(store: &Arc<MemStore>) -> IntegrationDeps {
    IntegrationDeps {
        store: store.clone(),
        reporter: Arc::new(NullReporter),
        mode: RunMode::Full,
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn full_run_pages_batches_and_finalizes() {
    let store = Arc::new(MemStore::new());

    let it = integration(vec![
        vec![user("u1", "u1@acme.com"), user("u2", "u2@acme.com")],
        vec![user("u3", "u3@acme.com")],
    ]);
    it.run(&deps(&store)).await.unwrap();

    let runs = store.sync_runs();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.source_kind, "okta");
    assert_eq!(run.source_name, "acme.okta.com");
    assert_eq!(run.status, RunStatus::Success);

    let counts = &run.stats["counts"];
    assert_eq!(counts["idp_users"]["observed"], 3);
    assert_eq!(counts["idp_users"]["expired"], 0);
    assert_eq!(counts["idp_groups"]["observed"], 1);
    assert_eq!(counts["idp_apps"]["observed"], 1);
    assert_eq!(counts["idp_assignments"]["observed"], 2);
    assert!(run.stats["duration_ms"].is_u64());
}

#[tokio::test]
async fn later_run_expires_absent_rows_and_leaves_other_sources_alone() {
    let store = Arc::new(MemStore::new());

    // Another tenant's rows must be untouched by acme's runs.
    store
        .upsert_idp_users_bulk_by_source(
            "okta",
            "other.okta.com",
            1,
            &[IdpUserRecord {
                external_id: "stranger".to_string(),
                email: None,
                display_name: None,
                status: None,
                mfa_enrolled: false,
            }],
        )
        .await
        .unwrap();

    integration(vec![vec![user("u1", "u1@acme.com"), user("u2", "u2@acme.com")]])
        .run(&deps(&store))
        .await
        .unwrap();

    // Second pass: u2 is gone upstream.
    integration(vec![vec![user("u1", "u1@acme.com")]])
        .run(&deps(&store))
        .await
        .unwrap();

    let runs = store.sync_runs();
    let second = runs.last().unwrap();
    assert_eq!(second.stats["counts"]["idp_users"]["observed"], 1);
    assert_eq!(second.stats["counts"]["idp_users"]["expired"], 1);

    let acme = store.idp_users_snapshot("okta", "acme.okta.com");
    let u1 = acme.iter().find(|u| u.record.external_id == "u1").unwrap();
    assert!(u1.expired_at.is_none());
    let u2 = acme.iter().find(|u| u.record.external_id == "u2").unwrap();
    assert!(u2.expired_at.is_some());

    // The other tenant's row was never expired: expiration is per source.
    let other = store.idp_users_snapshot("okta", "other.okta.com");
    assert_eq!(other.len(), 1);
    assert!(other[0].expired_at.is_none());
}

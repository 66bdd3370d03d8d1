//! Discovery runs: watermark clamped back by the safety margin, events and
//! sources recorded under the mode-suffixed source kind, and only the
//! discovery entity classes finalized.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use sspm_connectors::okta::{
    OktaApi, OktaApp, OktaAppAssignment, OktaConfig, OktaGroup, OktaIntegration, OktaLogEvent,
    OktaUser,
};
use sspm_connectors::Page;
use sspm_store::{DiscoveryEventRecord, RunStatus, Store};
use sspm_sync::{Integration, IntegrationDeps, NullReporter, RunMode};
use sspm_testkit::MemStore;

struct ScriptedDiscoveryOkta {
    events: Vec<OktaLogEvent>,
    observed_since: Mutex<Option<DateTime<Utc>>>,
}

#[async_trait]
impl OktaApi for ScriptedDiscoveryOkta {
    async fn list_users(&self, _after: Option<&str>) -> Result<Page<OktaUser>> {
        panic!("discovery run must not list users");
    }

    async fn list_groups(&self, _after: Option<&str>) -> Result<Page<OktaGroup>> {
        panic!("discovery run must not list groups");
    }

    async fn list_apps(&self, _after: Option<&str>) -> Result<Page<OktaApp>> {
        panic!("discovery run must not list apps");
    }

    async fn list_app_assignments(
        &self,
        _app_id: &str,
        _after: Option<&str>,
    ) -> Result<Page<OktaAppAssignment>> {
        panic!("discovery run must not list assignments");
    }

    async fn list_system_log(
        &self,
        since: DateTime<Utc>,
        _after: Option<&str>,
    ) -> Result<Page<OktaLogEvent>> {
        *self.observed_since.lock().unwrap() = Some(since);
        Ok(Page::last(self.events.clone()))
    }
}

fn signin(uuid: &str, app_id: &str, label: &str, actor: &str) -> OktaLogEvent {
    OktaLogEvent {
        uuid: uuid.to_string(),
        event_type: "user.authentication.sso".to_string(),
        published: Some(Utc::now()),
        actor_email: Some(actor.to_string()),
        app_id: Some(app_id.to_string()),
        app_label: Some(label.to_string()),
    }
}

fn deps(store: &Arc<MemStore>) -> IntegrationDeps {
    IntegrationDeps {
        store: store.clone(),
        reporter: Arc::new(NullReporter),
        mode: RunMode::Discovery,
        cancel: CancellationToken::new(),
    }
}

fn integration(api: Arc<ScriptedDiscoveryOkta>) -> OktaIntegration {
    OktaIntegration::new(
        OktaConfig {
            domain: "acme.okta.com".to_string(),
            api_token: "tok".to_string(),
        },
        api,
    )
}

#[tokio::test]
async fn discovery_clamps_watermark_by_fifteen_minutes() {
    let store = Arc::new(MemStore::new());

    // Prior discovery state: the newest observed event is one hour old.
    let watermark = Utc::now() - ChronoDuration::hours(1);
    store
        .upsert_discovery_events_bulk_by_source(
            "okta_discovery",
            "acme.okta.com",
            1,
            &[DiscoveryEventRecord {
                external_id: "older-evt".to_string(),
                source_external_id: "0oa-x:figma".to_string(),
                actor_email: None,
                event_kind: "signin".to_string(),
                observed_at: Some(watermark),
            }],
        )
        .await
        .unwrap();

    let api = Arc::new(ScriptedDiscoveryOkta {
        events: vec![signin("evt-1", "0oa-x", "Figma", "ada@acme.com")],
        observed_since: Mutex::new(None),
    });
    integration(api.clone()).run(&deps(&store)).await.unwrap();

    let since = api.observed_since.lock().unwrap().expect("since recorded");
    let expected = watermark - ChronoDuration::minutes(15);
    let drift = (since - expected).num_milliseconds().abs();
    assert!(drift < 5, "since must be watermark - 15m, drift {drift}ms");
}

#[tokio::test]
async fn discovery_records_sources_events_and_only_discovery_classes() {
    let store = Arc::new(MemStore::new());

    let api = Arc::new(ScriptedDiscoveryOkta {
        events: vec![
            signin("evt-1", "0oa-x", "Figma", "ada@acme.com"),
            signin("evt-2", "0oa-x", "Figma", "grace@acme.com"),
            signin("evt-3", "0oa-y", "Notion", "ada@acme.com"),
        ],
        observed_since: Mutex::new(None),
    });
    integration(api).run(&deps(&store)).await.unwrap();

    let runs = store.sync_runs();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.source_kind, "okta_discovery");
    assert_eq!(run.status, RunStatus::Success);

    let counts = run.stats["counts"].as_object().unwrap();
    assert_eq!(counts.len(), 2, "only discovery classes finalize: {counts:?}");
    assert_eq!(counts["discovery_sources"]["observed"], 2);
    assert_eq!(counts["discovery_events"]["observed"], 3);

    let events = store.discovery_events_snapshot("okta_discovery", "acme.okta.com");
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| e.record.source_external_id.contains(':')));
    assert_eq!(
        events[0].record.actor_email.as_deref(),
        Some("ada@acme.com")
    );
}

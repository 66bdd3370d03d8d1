//! Admin-surface routes composed with in-process doubles: health, sync-run
//! listing, and the resync trigger's sentinel-to-status mapping.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use sspm_store::{RunStatus, Store, SyncStats};
use sspm_sync::{RunRequest, Runner, SyncAlreadyRunning, SyncQueued};
use sspm_testkit::MemStore;
use sspm_worker::{routes, state::AppState};

struct SentinelRunner(fn() -> anyhow::Error);

#[async_trait]
impl Runner for SentinelRunner {
    async fn run_once(&self, _req: &RunRequest) -> Result<()> {
        Err((self.0)())
    }
}

fn app(store: Arc<MemStore>, trigger: Arc<dyn Runner>) -> axum::Router {
    let state = Arc::new(AppState::new(store, trigger.clone(), trigger));
    routes::build_router(state)
}

#[tokio::test]
async fn health_reports_service_identity() {
    let store = Arc::new(MemStore::new());
    let trigger: Arc<dyn Runner> = Arc::new(SentinelRunner(|| SyncQueued.into()));

    let response = app(store, trigger)
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "sspm-worker");
}

#[tokio::test]
async fn sync_runs_lists_recent_rows() {
    let store = Arc::new(MemStore::new());
    let run_id = store.create_sync_run("okta", "acme.okta.com").await.unwrap();
    store
        .mark_sync_run_success(run_id, &SyncStats::new(42))
        .await
        .unwrap();
    let failed = store.create_sync_run("vault", "vault.acme.dev").await.unwrap();
    store
        .fail_sync_run(failed, RunStatus::Error, "api exploded", "api")
        .await
        .unwrap();

    let trigger: Arc<dyn Runner> = Arc::new(SentinelRunner(|| SyncQueued.into()));
    let response = app(store, trigger)
        .oneshot(Request::get("/v1/sync/runs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r["status"] == "success"));
    assert!(rows.iter().any(|r| r["error_kind"] == "api"));
}

async fn post_resync(trigger: Arc<dyn Runner>, body: &str) -> StatusCode {
    let store = Arc::new(MemStore::new());
    let response = app(store, trigger)
        .oneshot(
            Request::post("/v1/sync/resync")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn resync_maps_sentinels_to_statuses() {
    let queued: Arc<dyn Runner> = Arc::new(SentinelRunner(|| SyncQueued.into()));
    assert_eq!(post_resync(queued, "{}").await, StatusCode::ACCEPTED);

    let busy: Arc<dyn Runner> = Arc::new(SentinelRunner(|| SyncAlreadyRunning.into()));
    assert_eq!(post_resync(busy, "{}").await, StatusCode::CONFLICT);

    let no_enabled: Arc<dyn Runner> =
        Arc::new(SentinelRunner(|| sspm_sync::NoEnabledConnectors.into()));
    assert_eq!(
        post_resync(no_enabled, "{}").await,
        StatusCode::PRECONDITION_FAILED
    );

    let hard: Arc<dyn Runner> = Arc::new(SentinelRunner(|| anyhow::anyhow!("pool exploded")));
    assert_eq!(
        post_resync(hard, "{}").await,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn resync_accepts_scoped_bodies() {
    let queued: Arc<dyn Runner> = Arc::new(SentinelRunner(|| SyncQueued.into()));
    let status = post_resync(
        queued,
        r#"{"connector_kind": "OKTA", "source_name": "acme.okta.com", "discovery": true}"#,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

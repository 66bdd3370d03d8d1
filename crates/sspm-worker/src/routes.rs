//! Axum router for the worker's thin admin surface: health, recent sync
//! runs, and the resync trigger. `build_router` returns the bare router;
//! middleware layers are attached in `main.rs` so tests can compose it
//! directly.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sspm_store::Store;
use sspm_sync::{
    is_no_connectors_due, is_no_enabled_connectors, is_sync_already_running, is_sync_queued,
    RunRequest, TriggerRequest,
};

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/sync/runs", get(sync_runs))
        .route("/v1/sync/resync", post(resync))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
}

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

#[derive(Serialize)]
struct SyncRunView {
    id: i64,
    source_kind: String,
    source_name: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    message: Option<String>,
    error_kind: Option<String>,
    stats: serde_json::Value,
}

async fn sync_runs(State(st): State<Arc<AppState>>) -> Response {
    match st.store.list_recent_sync_runs(50).await {
        Ok(runs) => {
            let views: Vec<SyncRunView> = runs
                .into_iter()
                .map(|r| SyncRunView {
                    id: r.id,
                    source_kind: r.source_kind,
                    source_name: r.source_name,
                    status: r.status.as_str().to_string(),
                    started_at: r.started_at.to_rfc3339(),
                    finished_at: r.finished_at.map(|t| t.to_rfc3339()),
                    message: r.message,
                    error_kind: r.error_kind,
                    stats: r.stats,
                })
                .collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct ResyncBody {
    #[serde(default)]
    pub connector_kind: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub discovery: bool,
}

#[derive(Serialize)]
struct ResyncResponse {
    outcome: &'static str,
}

/// Sentinel → HTTP mapping: queued 202, already-running 409, nothing
/// enabled or due 412, hard failure 500.
async fn resync(
    State(st): State<Arc<AppState>>,
    body: Option<Json<ResyncBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let scope = TriggerRequest::normalized(&body.connector_kind, &body.source_name);
    let req = RunRequest::forced(scope.clone(), CancellationToken::new());

    let runner = if body.discovery {
        &st.trigger_discovery
    } else {
        &st.trigger
    };

    info!(scoped = scope.is_some(), discovery = body.discovery, "resync requested");

    match runner.run_once(&req).await {
        Ok(()) => (StatusCode::OK, Json(ResyncResponse { outcome: "ok" })).into_response(),
        Err(err) if is_sync_queued(&err) => {
            (StatusCode::ACCEPTED, Json(ResyncResponse { outcome: "queued" })).into_response()
        }
        Err(err) if is_sync_already_running(&err) => {
            (StatusCode::CONFLICT, Json(ResyncResponse { outcome: "busy" })).into_response()
        }
        Err(err) if is_no_enabled_connectors(&err) || is_no_connectors_due(&err) => (
            StatusCode::PRECONDITION_FAILED,
            Json(ResyncResponse { outcome: "no-op" }),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

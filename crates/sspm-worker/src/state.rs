//! Shared runtime state for the worker's admin surface.

use std::sync::Arc;

use sspm_store::Store;
use sspm_sync::Runner;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Composite trigger runner: resync requests enqueue through here.
    pub trigger: Arc<dyn Runner>,
    /// Discovery-only trigger runner for scoped discovery requests.
    pub trigger_discovery: Arc<dyn Runner>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        trigger: Arc<dyn Runner>,
        trigger_discovery: Arc<dyn Runner>,
    ) -> Self {
        Self {
            store,
            trigger,
            trigger_discovery,
            build: BuildInfo {
                service: "sspm-worker",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

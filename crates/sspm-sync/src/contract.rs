//! The connector-run contract: what every integration implements and what
//! it receives while running.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use sspm_store::Store;

use crate::event::{Event, Reporter};
use crate::mode::RunMode;

/// Whether a connector is the identity provider of record or an application
/// source. At most one IdP integration runs per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idp,
    App,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Idp => "idp",
            Role::App => "app",
        }
    }
}

/// Everything a connector run gets to work with.
#[derive(Clone)]
pub struct IntegrationDeps {
    pub store: Arc<dyn Store>,
    pub reporter: Arc<dyn Reporter>,
    pub mode: RunMode,
    pub cancel: CancellationToken,
}

impl IntegrationDeps {
    pub fn report(&self, event: Event) {
        self.reporter.report(event);
    }
}

/// One configured connector instance, bound to a concrete tenant/org.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Lowercase stable tag (`okta`, `entra`, …).
    fn kind(&self) -> &str;

    /// Source identifier (domain/tenant/org) for `(source_kind, source_name)` keys.
    fn name(&self) -> &str;

    fn role(&self) -> Role;

    /// Events emitted before the run begins; seed the UI with stage rows.
    fn init_events(&self) -> Vec<Event> {
        Vec::new()
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()>;

    /// Integrations without an override are full-only.
    fn supports_run_mode(&self, mode: RunMode) -> bool {
        mode == RunMode::Full
    }

    /// Whether [`Integration::evaluate_compliance`] does anything for this
    /// connector. The orchestrator only schedules the evaluator (and takes
    /// the connector lock for it) when this is true.
    fn has_compliance_evaluator(&self) -> bool {
        false
    }

    async fn evaluate_compliance(&self, deps: &IntegrationDeps) -> Result<()> {
        let _ = deps;
        Ok(())
    }
}

/// A registered connector kind: decodes its opaque config blob and builds
/// integrations from it.
pub trait ConnectorDefinition: Send + Sync {
    fn kind(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn role(&self) -> Role;

    /// Whether the blob carries enough to attempt a sync (credentials and a
    /// source identifier). Unconfigured connectors are skipped silently.
    fn is_configured(&self, config: &Value) -> bool;

    /// Decode + validate the blob and build the integration. Decode or
    /// validation failures skip this connector without blocking others.
    fn new_integration(&self, config: &Value) -> Result<Box<dyn Integration>>;
}

/// Normalize an email for matching: trim + lowercase; empty means none.
pub fn normalize_email(raw: &str) -> Option<String> {
    let e = raw.trim().to_lowercase();
    if e.is_empty() {
        None
    } else {
        Some(e)
    }
}

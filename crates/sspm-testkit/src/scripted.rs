//! Scripted doubles for orchestrator and planner scenarios.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use sspm_sync::{
    ConnectorDefinition, Event, Integration, IntegrationDeps, Reporter, Role, RulesEngine, RunMode,
};

/// Captures every reported event for later assertions.
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<Event>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

type RunFn = Arc<
    dyn Fn(IntegrationDeps) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// An [`Integration`] whose run body is supplied by the test.
pub struct ScriptedIntegration {
    kind: String,
    name: String,
    role: Role,
    modes: Vec<RunMode>,
    run_fn: RunFn,
    runs: AtomicUsize,
}

impl ScriptedIntegration {
    pub fn new<F, Fut>(kind: &str, name: &str, role: Role, run_fn: F) -> Self
    where
        F: Fn(IntegrationDeps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            role,
            modes: vec![RunMode::Full],
            run_fn: Arc::new(move |deps| Box::pin(run_fn(deps))),
            runs: AtomicUsize::new(0),
        }
    }

    /// A connector that simply succeeds.
    pub fn succeeding(kind: &str, name: &str, role: Role) -> Self {
        Self::new(kind, name, role, |_| async { Ok(()) })
    }

    pub fn with_modes(mut self, modes: Vec<RunMode>) -> Self {
        self.modes = modes;
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Integration for ScriptedIntegration {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        self.role
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.run_fn)(deps.clone()).await
    }

    fn supports_run_mode(&self, mode: RunMode) -> bool {
        self.modes.contains(&mode)
    }
}

type BuildFn = Arc<dyn Fn(&Value) -> Result<Box<dyn Integration>> + Send + Sync>;

/// A [`ConnectorDefinition`] whose integration factory is supplied by the test.
pub struct ScriptedDefinition {
    kind: &'static str,
    role: Role,
    configured: bool,
    build: BuildFn,
}

impl ScriptedDefinition {
    pub fn new<F>(kind: &'static str, role: Role, configured: bool, build: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<dyn Integration>> + Send + Sync + 'static,
    {
        Self {
            kind,
            role,
            configured,
            build: Arc::new(build),
        }
    }
}

impl ConnectorDefinition for ScriptedDefinition {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn display_name(&self) -> &'static str {
        self.kind
    }

    fn role(&self) -> Role {
        self.role
    }

    fn is_configured(&self, _config: &Value) -> bool {
        self.configured
    }

    fn new_integration(&self, config: &Value) -> Result<Box<dyn Integration>> {
        (self.build)(config)
    }
}

/// Records global ruleset invocations instead of evaluating anything.
#[derive(Default)]
pub struct RecordingRulesEngine {
    invocations: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl RecordingRulesEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<(String, DateTime<Utc>)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RulesEngine for RecordingRulesEngine {
    async fn run(&self, scope_kind: &str, evaluated_at: DateTime<Utc>) -> Result<()> {
        self.invocations
            .lock()
            .unwrap()
            .push((scope_kind.to_string(), evaluated_at));
        Ok(())
    }
}

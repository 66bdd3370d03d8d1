//! Cross-connector orchestration: fan-out under per-connector locks, timeout
//! retry, post-run auto-link, compliance evaluators, identity resolution and
//! global ruleset evaluation, with partial-failure aggregation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sspm_lock::{connector_scope_name, run_locked, LockManager, SCOPE_KIND_CONNECTOR};
use sspm_store::Store;

use crate::contract::{Integration, IntegrationDeps, Role};
use crate::error::{is_retryable_timeout_error, join_errors};
use crate::event::{Event, NullReporter, Reporter};
use crate::mode::RunMode;
use crate::resolver;

// ---------------------------------------------------------------------------
// Eval mode
// ---------------------------------------------------------------------------

/// Whether post-sync evaluation phases tolerate integration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    #[default]
    BestEffort,
    Strict,
}

impl EvalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalMode::BestEffort => "best_effort",
            EvalMode::Strict => "strict",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "best_effort" => Ok(EvalMode::BestEffort),
            "strict" => Ok(EvalMode::Strict),
            other => Err(anyhow!("invalid eval mode: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules engine seam
// ---------------------------------------------------------------------------

/// Post-sync global ruleset invocation. Internals live elsewhere; the
/// orchestrator only knows the invocation contract.
#[async_trait]
pub trait RulesEngine: Send + Sync {
    async fn run(&self, scope_kind: &str, evaluated_at: DateTime<Utc>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TimeoutRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for TimeoutRetry {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::from_secs(5),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    integrations: Vec<Arc<dyn Integration>>,
    reporter: Arc<dyn Reporter>,
    rules: Option<Arc<dyn RulesEngine>>,
    eval_mode: EvalMode,
    mode: RunMode,
    retry: TimeoutRetry,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            store,
            locks,
            integrations: Vec::new(),
            reporter: Arc::new(NullReporter),
            rules: None,
            eval_mode: EvalMode::default(),
            mode: RunMode::Full,
            retry: TimeoutRetry::default(),
        }
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporter = reporter;
    }

    pub fn set_rules_engine(&mut self, rules: Arc<dyn RulesEngine>) {
        self.rules = Some(rules);
    }

    pub fn set_global_eval_mode(&mut self, mode: EvalMode) {
        self.eval_mode = mode;
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    pub fn set_timeout_retry(&mut self, retry: TimeoutRetry) {
        self.retry = retry;
    }

    /// Admission checks: non-empty identity, unique `(kind, name)`, and at
    /// most one IdP integration per pass.
    pub fn add_integration(&mut self, integration: Arc<dyn Integration>) -> Result<()> {
        let kind = integration.kind().trim().to_string();
        let name = integration.name().trim().to_string();
        if kind.is_empty() {
            return Err(anyhow!("integration with empty kind rejected"));
        }
        if name.is_empty() {
            return Err(anyhow!("integration {kind} with empty name rejected"));
        }

        for existing in &self.integrations {
            if existing.kind() == kind && existing.name().eq_ignore_ascii_case(&name) {
                return Err(anyhow!("duplicate integration {kind}/{name}"));
            }
        }

        if integration.role() == Role::Idp
            && self.integrations.iter().any(|i| i.role() == Role::Idp)
        {
            return Err(anyhow!(
                "second IdP integration {kind}/{name} rejected; at most one IdP per pass"
            ));
        }

        self.integrations.push(integration);
        Ok(())
    }

    pub fn integration_count(&self) -> usize {
        self.integrations.len()
    }

    /// One pass. Connector failures never abort peers; everything is joined
    /// into the return. `sync/done` is emitted exactly once, after every
    /// task has completed.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        for integration in &self.integrations {
            for event in integration.init_events() {
                self.reporter.report(event);
            }
        }

        let mut errs: Vec<anyhow::Error> = Vec::new();
        let mut failed: HashSet<(String, String)> = HashSet::new();

        // Fan-out. The JoinSet is drained to completion before anything
        // else happens, so no late task can publish after this pass ends.
        let mut tasks: JoinSet<((String, String), Result<()>)> = JoinSet::new();
        for integration in self.integrations.iter().cloned() {
            let store = self.store.clone();
            let reporter = self.reporter.clone();
            let locks = self.locks.clone();
            let mode = self.mode;
            let retry = self.retry;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let key = (
                    integration.kind().to_string(),
                    integration.name().to_string(),
                );
                let res =
                    run_one_with_retry(integration, store, reporter, locks, mode, cancel, retry)
                        .await;
                (key, res)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((key, Err(err))) => {
                    let ctx = format!("{}/{} sync failed", key.0, key.1);
                    failed.insert(key);
                    errs.push(err.context(ctx));
                }
                Err(join_err) => {
                    errs.push(anyhow!("connector task aborted: {join_err}"));
                }
            }
        }

        // Auto-link: app-role integrations that synced cleanly, full mode only.
        if self.mode == RunMode::Full {
            self.auto_link_pass(&failed, &mut errs).await;
        }

        // Per-connector compliance evaluators.
        self.compliance_pass(cancel, &failed, &mut errs).await;

        // Identity resolution, full mode only.
        if self.mode == RunMode::Full {
            if let Err(err) = resolver::resolve_identities(&self.store, &self.reporter, cancel).await
            {
                errs.push(err.context("identity resolution failed"));
            }
        }

        // Global ruleset.
        if self.mode == RunMode::Full {
            if let Some(rules) = &self.rules {
                if self.eval_mode == EvalMode::BestEffort || failed.is_empty() {
                    if let Err(err) = rules.run("global", Utc::now()).await {
                        errs.push(err.context("global ruleset evaluation failed"));
                    }
                } else {
                    self.reporter.report(Event::message(
                        "sync",
                        "rules",
                        "skipped global ruleset: integration errors under strict mode",
                    ));
                }
            }
        }

        let mut done = Event::done("sync", "done");
        if !errs.is_empty() {
            done.err = Some(
                errs.iter()
                    .map(|e| format!("{e:#}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        self.reporter.report(done);

        match join_errors(errs) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn auto_link_pass(
        &self,
        failed: &HashSet<(String, String)>,
        errs: &mut Vec<anyhow::Error>,
    ) {
        let apps: Vec<&Arc<dyn Integration>> = self
            .integrations
            .iter()
            .filter(|i| {
                i.role() == Role::App
                    && !failed.contains(&(i.kind().to_string(), i.name().to_string()))
            })
            .collect();

        let total = apps.len() as i64;
        for (idx, integration) in apps.iter().enumerate() {
            self.reporter.report(
                Event::progress("matching", "auto-link", idx as i64, total)
                    .with_message(format!("{}/{}", integration.kind(), integration.name())),
            );
            match self
                .store
                .bulk_auto_link_by_email(integration.kind(), integration.name())
                .await
            {
                Ok(linked) => {
                    debug!(
                        kind = integration.kind(),
                        name = integration.name(),
                        linked,
                        "auto-link complete"
                    );
                }
                Err(err) => {
                    errs.push(err.context(format!(
                        "auto-link failed for {}/{}",
                        integration.kind(),
                        integration.name()
                    )));
                }
            }
        }
        self.reporter
            .report(Event::progress("matching", "auto-link", total, total));
    }

    async fn compliance_pass(
        &self,
        cancel: &CancellationToken,
        failed: &HashSet<(String, String)>,
        errs: &mut Vec<anyhow::Error>,
    ) {
        let any_failed = !failed.is_empty();

        for integration in &self.integrations {
            if !integration.has_compliance_evaluator() {
                continue;
            }
            let key = (
                integration.kind().to_string(),
                integration.name().to_string(),
            );
            if failed.contains(&key) {
                continue;
            }
            if self.eval_mode == EvalMode::Strict && any_failed {
                self.reporter.report(Event::message(
                    format!("{}/{}", key.0, key.1),
                    "compliance",
                    "skipped: integration errors under strict mode",
                ));
                continue;
            }

            let scope_name = connector_scope_name(integration.kind(), integration.name());
            let lock = match self
                .locks
                .acquire(SCOPE_KIND_CONNECTOR, &scope_name, cancel)
                .await
            {
                Ok(lock) => lock,
                Err(err) => {
                    errs.push(err.context(format!("compliance lock failed for {scope_name}")));
                    continue;
                }
            };

            let integration = integration.clone();
            let store = self.store.clone();
            let reporter = self.reporter.clone();
            let mode = self.mode;
            let res = run_locked(lock, cancel, |child| {
                let deps = IntegrationDeps {
                    store,
                    reporter,
                    mode,
                    cancel: child,
                };
                async move { integration.evaluate_compliance(&deps).await }
            })
            .await;

            if let Err(err) = res {
                errs.push(err.context(format!("compliance evaluation failed for {scope_name}")));
            }
        }
    }
}

/// One connector run under its lock, with a bounded retry for genuine
/// timeouts. A lost lease or a cancellation is never retried; each retry
/// reacquires the lock.
async fn run_one_with_retry(
    integration: Arc<dyn Integration>,
    store: Arc<dyn Store>,
    reporter: Arc<dyn Reporter>,
    locks: Arc<dyn LockManager>,
    mode: RunMode,
    cancel: CancellationToken,
    retry: TimeoutRetry,
) -> Result<()> {
    let scope_name = connector_scope_name(integration.kind(), integration.name());
    let mut attempt: u32 = 0;

    loop {
        let lock = locks
            .acquire(SCOPE_KIND_CONNECTOR, &scope_name, &cancel)
            .await
            .with_context(|| format!("connector lock failed for {scope_name}"))?;

        let integration_run = integration.clone();
        let store_run = store.clone();
        let reporter_run = reporter.clone();
        let res = run_locked(lock, &cancel, |child| {
            let deps = IntegrationDeps {
                store: store_run,
                reporter: reporter_run,
                mode,
                cancel: child,
            };
            async move { integration_run.run(&deps).await }
        })
        .await;

        match res {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt < retry.attempts && is_retryable_timeout_error(&err) {
                    attempt += 1;
                    warn!(
                        scope = %scope_name,
                        attempt,
                        error = %err,
                        "connector run timed out; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(retry.delay) => {}
                    }
                    continue;
                }
                return Err(err);
            }
        }
    }
}

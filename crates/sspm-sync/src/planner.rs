//! The DB-driven planner: read connector configs, filter by enabled /
//! configured / mode / scope, consult the run policy, and hand the
//! surviving set to a fresh orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use sspm_lock::LockManager;
use sspm_store::{FinishedRun, SourceRef, Store};

use crate::contract::{ConnectorDefinition, Integration};
use crate::error::{join_errors, NoConnectorsDue, NoEnabledConnectors};
use crate::event::{Event, Reporter};
use crate::mode::RunMode;
use crate::orchestrator::{EvalMode, Orchestrator, RulesEngine, TimeoutRetry};
use crate::policy::RunPolicy;
use crate::runner::{RunRequest, Runner};

pub struct DbRunner {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    registry: Vec<Arc<dyn ConnectorDefinition>>,
    policy: RunPolicy,
    reporter: Arc<dyn Reporter>,
    rules: Option<Arc<dyn RulesEngine>>,
    eval_mode: EvalMode,
    retry: TimeoutRetry,
    mode: RunMode,
}

impl DbRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn LockManager>,
        registry: Vec<Arc<dyn ConnectorDefinition>>,
        policy: RunPolicy,
        reporter: Arc<dyn Reporter>,
        rules: Option<Arc<dyn RulesEngine>>,
        eval_mode: EvalMode,
        mode: RunMode,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            policy,
            reporter,
            rules,
            eval_mode,
            retry: TimeoutRetry::default(),
            mode,
        }
    }

    fn definition_for(&self, kind: &str) -> Option<&Arc<dyn ConnectorDefinition>> {
        self.registry.iter().find(|d| d.kind() == kind)
    }

    async fn history_for(
        &self,
        batched: &Option<HashMap<SourceRef, Vec<FinishedRun>>>,
        source: &SourceRef,
    ) -> Vec<FinishedRun> {
        match batched {
            Some(map) => map.get(source).cloned().unwrap_or_default(),
            // Batched fetch failed: fall back per candidate rather than
            // blocking the whole pass on a single query.
            None => self
                .store
                .list_recent_finished_sync_runs_by_source(
                    &source.kind,
                    &source.name,
                    self.policy.recent_finished_run_cap,
                )
                .await
                .unwrap_or_else(|err| {
                    warn!(
                        source_kind = %source.kind,
                        source_name = %source.name,
                        error = %err,
                        "per-source history fetch failed; treating as empty"
                    );
                    Vec::new()
                }),
        }
    }
}

#[async_trait]
impl Runner for DbRunner {
    async fn run_once(&self, req: &RunRequest) -> Result<()> {
        let configs = self.store.list_connector_configs().await?;

        let mut build_errors: Vec<anyhow::Error> = Vec::new();
        let mut candidates: Vec<(Arc<dyn Integration>, SourceRef)> = Vec::new();
        let mut disabled: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for row in configs {
            if let Some(scope) = &req.scope {
                if row.kind != scope.connector_kind {
                    continue;
                }
            }
            if !row.enabled {
                disabled.push(row.kind);
                continue;
            }

            let Some(def) = self.definition_for(&row.kind) else {
                skipped.push(row.kind.clone());
                build_errors.push(anyhow!("no connector definition for kind {}", row.kind));
                continue;
            };
            if !def.is_configured(&row.config) {
                skipped.push(row.kind);
                continue;
            }

            let integration: Arc<dyn Integration> = match def.new_integration(&row.config) {
                Ok(integration) => Arc::from(integration),
                Err(err) => {
                    skipped.push(row.kind.clone());
                    build_errors
                        .push(err.context(format!("building {} integration failed", row.kind)));
                    continue;
                }
            };
            if !integration.supports_run_mode(self.mode) {
                skipped.push(row.kind);
                continue;
            }

            let run_source = SourceRef::new(
                self.mode.source_kind_for(integration.kind()),
                integration.name(),
            );
            candidates.push((integration, run_source));
        }

        // One round trip for all candidate histories.
        let mut sources: Vec<SourceRef> = candidates.iter().map(|(_, s)| s.clone()).collect();
        sources.sort();
        sources.dedup();
        let batched = match self
            .store
            .list_recent_finished_sync_runs_for_sources(
                &sources,
                self.policy.recent_finished_run_cap,
            )
            .await
        {
            Ok(map) => Some(map),
            Err(err) => {
                warn!(error = %err, "batched history fetch failed; falling back per source");
                None
            }
        };

        let now = Utc::now();
        let mut deferred: Vec<(String, String)> = Vec::new();
        let mut planned: Vec<String> = Vec::new();

        let mut orchestrator = Orchestrator::new(self.store.clone(), self.locks.clone());
        orchestrator.set_reporter(self.reporter.clone());
        orchestrator.set_run_mode(self.mode);
        orchestrator.set_global_eval_mode(self.eval_mode);
        orchestrator.set_timeout_retry(self.retry);
        if let Some(rules) = &self.rules {
            orchestrator.set_rules_engine(rules.clone());
        }

        for (integration, run_source) in candidates {
            if let Some(scope) = &req.scope {
                if !integration
                    .name()
                    .eq_ignore_ascii_case(scope.source_name.trim())
                {
                    continue;
                }
            }

            if !req.forced {
                let history = self.history_for(&batched, &run_source).await;
                let decision = self.policy.decide(now, integration.kind(), &history);
                if !decision.should_run {
                    debug!(
                        source_kind = %run_source.kind,
                        source_name = %run_source.name,
                        reason = %decision.reason,
                        "connector deferred"
                    );
                    deferred.push((format!("{}/{}", run_source.kind, run_source.name), decision.reason));
                    continue;
                }
            }

            let label = format!("{}/{}", run_source.kind, run_source.name);
            match orchestrator.add_integration(integration) {
                Ok(()) => planned.push(label),
                Err(err) => build_errors.push(err),
            }
        }

        self.reporter.report(Event::message(
            "sync",
            "plan",
            format!(
                "mode={} planned=[{}] deferred=[{}] disabled=[{}] skipped=[{}]",
                self.mode.as_str(),
                planned.join(","),
                deferred
                    .iter()
                    .map(|(s, _)| s.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                disabled.join(","),
                skipped.join(","),
            ),
        ));

        if planned.is_empty() {
            if !build_errors.is_empty() {
                let mut errs = vec![anyhow::Error::new(NoEnabledConnectors)];
                errs.extend(build_errors);
                return Err(join_errors(errs).expect("non-empty"));
            }
            if !deferred.is_empty() || req.scope.is_some() {
                return Err(NoConnectorsDue.into());
            }
            return Err(NoEnabledConnectors.into());
        }

        let mut errs = build_errors;
        if let Err(err) = orchestrator.run_once(&req.cancel).await {
            errs.push(err);
        }
        match join_errors(errs) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

//! Builds the whole sync runtime out of settings: store, lock manager,
//! planners, gates, trigger bus and scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sspm_config::{LockMode, Settings};
use sspm_lock::{AdvisoryLockManager, LeaseLockConfig, LeaseLockManager, LockManager};
use sspm_store::{PgStore, Store};
use sspm_sync::{
    CompositeRunner, DbRunner, EvalMode, ProgressLogConfig, ProgressLogger, Reporter, RulesEngine,
    RunMode, RunOnceGate, RunPolicy, Runner, Scheduler, TriggerListener, TriggerRunner,
    TriggerWake,
};

const WAKE_CHANNEL_CAPACITY: usize = 8;

/// Global ruleset stub: the rules engine proper lives elsewhere; the worker
/// only honors the invocation contract.
pub struct LoggingRulesEngine;

#[async_trait]
impl RulesEngine for LoggingRulesEngine {
    async fn run(&self, scope_kind: &str, evaluated_at: DateTime<Utc>) -> Result<()> {
        info!(scope_kind, %evaluated_at, "global ruleset evaluation requested");
        Ok(())
    }
}

pub struct WorkerRuntime {
    pub store: Arc<dyn Store>,
    pub pool: PgPool,
    pub settings: Settings,
    /// Policy-gated pass over both modes; driven by the scheduler tick.
    pub scheduled: Arc<dyn Runner>,
    /// Try-gated planners for trigger wakeups.
    pub wake_full: Arc<dyn Runner>,
    pub wake_discovery: Arc<dyn Runner>,
    /// Enqueue side of the trigger bus.
    pub trigger_composite: Arc<dyn Runner>,
    pub trigger_discovery: Arc<dyn Runner>,
}

impl WorkerRuntime {
    pub fn build(settings: Settings, pool: PgPool) -> Result<Self> {
        let pg = PgStore::new(pool.clone());
        let store: Arc<dyn Store> = Arc::new(pg);

        let locks: Arc<dyn LockManager> = match settings.lock_mode {
            LockMode::Lease => Arc::new(LeaseLockManager::new(
                store.clone(),
                LeaseLockConfig {
                    ttl: settings.lock_ttl,
                    heartbeat_interval: settings.heartbeat_interval,
                },
            )),
            LockMode::Advisory => Arc::new(AdvisoryLockManager::new(pool.clone())),
        };

        let policy = RunPolicy {
            interval_by_kind: settings.interval_by_kind.clone(),
            default_interval: settings.default_interval,
            failure_backoff_base: settings.failure_backoff_base,
            failure_backoff_max: settings.failure_backoff_max,
            recent_finished_run_cap: settings.recent_finished_run_cap,
        };

        let eval_mode = EvalMode::parse(&settings.global_eval_mode)
            .context("resolving global eval mode failed")?;
        let reporter: Arc<dyn Reporter> =
            Arc::new(ProgressLogger::new(ProgressLogConfig::default()));
        let rules: Arc<dyn RulesEngine> = Arc::new(LoggingRulesEngine);

        let planner_for = |mode: RunMode| -> Arc<dyn Runner> {
            Arc::new(DbRunner::new(
                store.clone(),
                locks.clone(),
                sspm_connectors::registry(),
                policy.clone(),
                reporter.clone(),
                Some(rules.clone()),
                eval_mode,
                mode,
            ))
        };
        let planner_full = planner_for(RunMode::Full);
        let planner_discovery = planner_for(RunMode::Discovery);

        let scheduled: Arc<dyn Runner> = Arc::new(CompositeRunner::new(vec![
            Arc::new(RunOnceGate::blocking(
                planner_full.clone(),
                locks.clone(),
                RunMode::Full,
            )),
            Arc::new(RunOnceGate::blocking(
                planner_discovery.clone(),
                locks.clone(),
                RunMode::Discovery,
            )),
        ]));

        let wake_full: Arc<dyn Runner> = Arc::new(RunOnceGate::try_lock(
            planner_full,
            locks.clone(),
            RunMode::Full,
        ));
        let wake_discovery: Arc<dyn Runner> = Arc::new(RunOnceGate::try_lock(
            planner_discovery,
            locks.clone(),
            RunMode::Discovery,
        ));

        let trigger_full: Arc<dyn Runner> = Arc::new(TriggerRunner::new(
            store.clone(),
            locks.clone(),
            RunMode::Full,
        ));
        let trigger_discovery: Arc<dyn Runner> = Arc::new(TriggerRunner::new(
            store.clone(),
            locks.clone(),
            RunMode::Discovery,
        ));
        let trigger_composite: Arc<dyn Runner> = Arc::new(CompositeRunner::new(vec![
            trigger_full,
            trigger_discovery.clone(),
        ]));

        Ok(Self {
            store,
            pool,
            settings,
            scheduled,
            wake_full,
            wake_discovery,
            trigger_composite,
            trigger_discovery,
        })
    }

    /// Spawn the notification listeners and the scheduler loop. Returns once
    /// everything is running; tasks stop when `cancel` fires.
    pub fn spawn_sync_loop(&self, cancel: CancellationToken) {
        let (wake_tx, wake_rx) = mpsc::channel::<TriggerWake>(WAKE_CHANNEL_CAPACITY);

        for mode in [RunMode::Full, RunMode::Discovery] {
            let listener = TriggerListener::new(self.pool.clone(), mode, wake_tx.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = listener.run(cancel).await {
                    error!(mode = mode.as_str(), error = %format!("{err:#}"), "trigger listener exited");
                }
            });
        }

        let scheduler = Scheduler {
            interval: self.settings.scheduler_interval,
            scheduled: self.scheduled.clone(),
            full: self.wake_full.clone(),
            discovery: self.wake_discovery.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = scheduler.run(wake_rx, cancel).await {
                error!(error = %format!("{err:#}"), "scheduler exited");
            }
        });
    }
}

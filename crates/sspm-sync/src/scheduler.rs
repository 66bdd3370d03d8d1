//! The periodic driver: a ticker for scheduled passes plus the wake channel
//! fed by the notification listeners for forced/scoped passes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{
    is_no_connectors_due, is_no_enabled_connectors, is_sync_already_running, is_sync_queued,
};
use crate::mode::RunMode;
use crate::runner::{RunRequest, Runner};
use crate::trigger::TriggerWake;

pub struct Scheduler {
    /// Tick cadence; must be positive. First tick fires immediately.
    pub interval: Duration,
    /// Runner for scheduled (policy-gated) passes, typically a composite
    /// of the blocking run-once gates for both modes.
    pub scheduled: Arc<dyn Runner>,
    /// Runner for full-mode trigger wakeups (try-gated planner).
    pub full: Arc<dyn Runner>,
    /// Runner for discovery-mode trigger wakeups (try-gated planner).
    pub discovery: Arc<dyn Runner>,
}

impl Scheduler {
    /// Single loop; runner failures log and the loop keeps ticking.
    pub async fn run(
        self,
        mut wakes: mpsc::Receiver<TriggerWake>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("scheduler interval must be positive"));
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let req = RunRequest::scheduled(cancel.child_token());
                    if let Err(err) = self.scheduled.run_once(&req).await {
                        log_pass_outcome("scheduled", &err);
                    }
                }
                wake = wakes.recv() => {
                    let Some(wake) = wake else { return Ok(()) };
                    let runner = match wake.mode {
                        RunMode::Full => &self.full,
                        RunMode::Discovery => &self.discovery,
                    };
                    let req = RunRequest::forced(wake.scope, cancel.child_token());
                    if let Err(err) = runner.run_once(&req).await {
                        log_pass_outcome(wake.mode.as_str(), &err);
                    }
                }
            }
        }
    }
}

/// Sentinel outcomes are operational signals, not failures; only real
/// errors reach the error log.
fn log_pass_outcome(label: &str, err: &anyhow::Error) {
    if is_no_connectors_due(err)
        || is_no_enabled_connectors(err)
        || is_sync_queued(err)
        || is_sync_already_running(err)
    {
        debug!(pass = label, outcome = %err, "sync pass skipped");
    } else {
        error!(pass = label, error = %format!("{err:#}"), "sync pass failed");
    }
}

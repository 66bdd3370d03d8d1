//! The notification-driven trigger bus.
//!
//! The enqueue side ([`TriggerRunner`]) briefly takes the mode's run-once
//! lock (try variant, so piled-up triggers collapse into "already running"),
//! issues the NOTIFY, and reports [`SyncQueued`]; the actual pass happens in
//! whichever worker is listening. The listen side ([`TriggerListener`])
//! holds a dedicated connection and forwards decoded payloads to an
//! in-process channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sspm_lock::{Lock, LockManager, SCOPE_KIND_SYNC};
use sspm_store::Store;

use crate::error::{
    is_no_connectors_due, is_no_enabled_connectors, is_sync_already_running, is_sync_queued,
    join_errors, NoConnectorsDue, NoEnabledConnectors, SyncAlreadyRunning, SyncQueued,
};
use crate::mode::{is_discovery_capable, RunMode};
use crate::runner::{RunRequest, Runner};

// ---------------------------------------------------------------------------
// TriggerRequest
// ---------------------------------------------------------------------------

/// A scoped resync request: `(connector_kind, source_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub connector_kind: String,
    pub source_name: String,
}

impl TriggerRequest {
    /// Normalize a raw scope: lowercase kind, trimmed name. Empty on either
    /// side means the request is unscoped.
    pub fn normalized(kind: &str, name: &str) -> Option<Self> {
        let kind = kind.trim().to_lowercase();
        let name = name.trim().to_string();
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            connector_kind: kind,
            source_name: name,
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a NOTIFY payload. Empty or malformed payloads are unscoped;
    /// a garbled trigger still wakes the worker, it just loses its scope.
    pub fn decode(payload: &str) -> Option<Self> {
        if payload.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<TriggerRequest>(payload) {
            Ok(req) => TriggerRequest::normalized(&req.connector_kind, &req.source_name),
            Err(err) => {
                warn!(error = %err, "malformed trigger payload; treating as unscoped");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerRunner (enqueue side)
// ---------------------------------------------------------------------------

pub struct TriggerRunner {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    mode: RunMode,
}

impl TriggerRunner {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockManager>, mode: RunMode) -> Self {
        Self { store, locks, mode }
    }
}

#[async_trait]
impl Runner for TriggerRunner {
    async fn run_once(&self, req: &RunRequest) -> Result<()> {
        // Discovery triggers for kinds without a discovery pull are refused
        // before any lock work.
        if self.mode == RunMode::Discovery {
            if let Some(scope) = &req.scope {
                if !is_discovery_capable(&scope.connector_kind) {
                    return Err(NoConnectorsDue.into());
                }
            }
        }

        let Some(lock) = self
            .locks
            .try_acquire(SCOPE_KIND_SYNC, self.mode.runonce_scope())
            .await?
        else {
            return Err(SyncAlreadyRunning.into());
        };

        let payload = req.scope.as_ref().map(TriggerRequest::encode);
        let notify_res = async {
            // A session-pinning lock must carry the NOTIFY itself: against a
            // 1-connection pool, a pool-routed NOTIFY would deadlock behind
            // the connection the lock holds.
            let handled = lock
                .notify_on_held_conn(self.mode.channel(), payload.as_deref())
                .await?;
            if !handled {
                self.store
                    .notify(self.mode.channel(), payload.as_deref())
                    .await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(err) = lock.release().await {
            warn!(error = %err, "trigger run-once lock release failed");
        }
        notify_res.context("resync trigger notify failed")?;

        debug!(mode = self.mode.as_str(), scoped = req.scope.is_some(), "resync queued");
        Err(SyncQueued.into())
    }
}

// ---------------------------------------------------------------------------
// CompositeRunner
// ---------------------------------------------------------------------------

/// Dispatches one request across several wrapped runners (typically both
/// modes) and folds their outcomes into a single signal.
pub struct CompositeRunner {
    runners: Vec<Arc<dyn Runner>>,
}

impl CompositeRunner {
    pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
        Self { runners }
    }
}

#[async_trait]
impl Runner for CompositeRunner {
    async fn run_once(&self, req: &RunRequest) -> Result<()> {
        let mut hard: Vec<anyhow::Error> = Vec::new();
        let mut any_success = false;
        let mut any_queued = false;
        let mut any_busy = false;
        let mut any_due_signal = false;

        for runner in &self.runners {
            match runner.run_once(req).await {
                Ok(()) => any_success = true,
                Err(err) => {
                    if is_sync_queued(&err) {
                        any_queued = true;
                    } else if is_sync_already_running(&err) {
                        any_busy = true;
                    } else if is_no_connectors_due(&err) {
                        any_due_signal = true;
                    } else if is_no_enabled_connectors(&err) {
                        // no-op member
                    } else {
                        hard.push(err);
                    }
                }
            }
        }

        if !hard.is_empty() {
            return Err(join_errors(hard).expect("non-empty hard errors"));
        }
        if any_success {
            return Ok(());
        }
        if any_queued {
            return Err(SyncQueued.into());
        }
        if any_busy {
            return Err(SyncAlreadyRunning.into());
        }
        if any_due_signal {
            return Err(NoConnectorsDue.into());
        }
        Err(NoEnabledConnectors.into())
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A decoded wakeup delivered from the notification listener to the
/// scheduler loop.
#[derive(Debug, Clone)]
pub struct TriggerWake {
    pub mode: RunMode,
    pub scope: Option<TriggerRequest>,
}

/// Background LISTEN loop for one channel. Runs on its own dedicated
/// connection (never a pooled one, so a busy pool cannot starve wakeups).
pub struct TriggerListener {
    pool: PgPool,
    mode: RunMode,
    tx: mpsc::Sender<TriggerWake>,
}

impl TriggerListener {
    pub fn new(pool: PgPool, mode: RunMode, tx: mpsc::Sender<TriggerWake>) -> Self {
        Self { pool, mode, tx }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("trigger listener connect failed")?;
        listener
            .listen(self.mode.channel())
            .await
            .with_context(|| format!("LISTEN {} failed", self.mode.channel()))?;

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                n = listener.recv() => n.context("notification wait failed")?,
            };

            let scope = TriggerRequest::decode(notification.payload());
            let wake = TriggerWake {
                mode: self.mode,
                scope,
            };
            if !deliver_wake(&self.tx, wake, &cancel).await {
                return Ok(());
            }
        }
    }
}

/// Enqueue policy for decoded wakeups. Unscoped wakeups are best-effort: if
/// the channel is full a pass is already pending, so dropping this one
/// loses nothing. Scoped requests must not be lost: they block until the
/// scheduler accepts them or shutdown is requested. Returns `false` when
/// the caller should stop (receiver gone or canceled).
pub async fn deliver_wake(
    tx: &mpsc::Sender<TriggerWake>,
    wake: TriggerWake,
    cancel: &CancellationToken,
) -> bool {
    match wake.scope {
        None => {
            let mode = wake.mode;
            if tx.try_send(wake).is_err() {
                debug!(mode = mode.as_str(), "wake channel full; dropped unscoped trigger");
            }
            true
        }
        Some(_) => {
            tokio::select! {
                _ = cancel.cancelled() => false,
                sent = tx.send(wake) => sent.is_ok(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn normalization_lowercases_kind_and_trims_name() {
        let req = TriggerRequest::normalized(" OKTA ", " acme.okta.com ").unwrap();
        assert_eq!(req.connector_kind, "okta");
        assert_eq!(req.source_name, "acme.okta.com");
    }

    #[test]
    fn empty_side_means_unscoped() {
        assert!(TriggerRequest::normalized("", "acme").is_none());
        assert!(TriggerRequest::normalized("okta", "  ").is_none());
    }

    #[test]
    fn decode_round_trip() {
        let req = TriggerRequest::normalized("entra", "contoso.example").unwrap();
        assert_eq!(TriggerRequest::decode(&req.encode()), Some(req));
    }

    #[test]
    fn decode_malformed_is_unscoped() {
        assert_eq!(TriggerRequest::decode(""), None);
        assert_eq!(TriggerRequest::decode("not json"), None);
        assert_eq!(TriggerRequest::decode(r#"{"connector_kind": 7}"#), None);
    }

    #[test]
    fn decode_normalizes_payload_fields() {
        let decoded =
            TriggerRequest::decode(r#"{"connector_kind":"OKTA","source_name":" Acme "}"#).unwrap();
        assert_eq!(decoded.connector_kind, "okta");
        assert_eq!(decoded.source_name, "Acme");
    }

    fn unscoped() -> TriggerWake {
        TriggerWake {
            mode: RunMode::Full,
            scope: None,
        }
    }

    fn scoped() -> TriggerWake {
        TriggerWake {
            mode: RunMode::Full,
            scope: TriggerRequest::normalized("okta", "acme"),
        }
    }

    #[tokio::test]
    async fn unscoped_wake_drops_when_channel_full() {
        let (tx, mut rx) = mpsc::channel::<TriggerWake>(1);
        let cancel = CancellationToken::new();

        assert!(deliver_wake(&tx, unscoped(), &cancel).await);
        // Channel now full; the second unscoped wake is dropped without
        // blocking.
        let delivered = tokio::time::timeout(
            Duration::from_millis(200),
            deliver_wake(&tx, unscoped(), &cancel),
        )
        .await
        .expect("unscoped delivery must not block");
        assert!(delivered);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "dropped wake must not arrive");
    }

    #[tokio::test]
    async fn scoped_wake_blocks_until_received() {
        let (tx, mut rx) = mpsc::channel::<TriggerWake>(1);
        let cancel = CancellationToken::new();

        // Fill the channel, then deliver a scoped wake concurrently: it
        // must wait for the receiver rather than dropping.
        assert!(deliver_wake(&tx, unscoped(), &cancel).await);
        let deliver = tokio::spawn({
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move { deliver_wake(&tx, scoped(), &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deliver.is_finished(), "scoped wake should still be waiting");

        assert!(rx.recv().await.is_some());
        assert!(deliver.await.unwrap());
        let wake = rx.recv().await.unwrap();
        assert!(wake.scope.is_some());
    }

    #[tokio::test]
    async fn scoped_wake_unblocks_on_cancel() {
        let (tx, _rx) = mpsc::channel::<TriggerWake>(1);
        let cancel = CancellationToken::new();
        assert!(deliver_wake(&tx, unscoped(), &cancel).await);

        let deliver = tokio::spawn({
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move { deliver_wake(&tx, scoped(), &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(!deliver.await.unwrap());
    }
}

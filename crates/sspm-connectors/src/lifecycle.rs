//! The canonical run shape shared by every driver: create the sync_run row,
//! page + batch, finalize in one transaction, and record failures with
//! their classification even when the pass is being torn down.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sspm_store::{EntityClass, RunStatus, Store, SyncStats};
use sspm_sync::{error_kind, is_canceled, Canceled, Event, IntegrationDeps, Reporter};

// Batch sizes per entity family. Each batch is one transactional store call.
pub(crate) const USER_BATCH: usize = 1000;
pub(crate) const ENTITLEMENT_BATCH: usize = 5000;
pub(crate) const ASSET_BATCH: usize = 1000;
pub(crate) const OWNER_BATCH: usize = 1000;
pub(crate) const CREDENTIAL_BATCH: usize = 1000;
pub(crate) const EVENT_BATCH: usize = 2000;

// ---------------------------------------------------------------------------
// Failure tagging
// ---------------------------------------------------------------------------

/// Wraps a failure with the `error_kind` its site implies (`api` for vendor
/// calls, `db` for store calls). Each failure site tags exactly once.
#[derive(Debug)]
pub struct TaggedFailure {
    kind: &'static str,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for TaggedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure", self.kind)
    }
}

impl std::error::Error for TaggedFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

pub trait TagErr<T> {
    /// Mark a failure as an upstream vendor problem.
    fn tag_api(self) -> Result<T>;
    /// Mark a failure as a repository problem.
    fn tag_db(self) -> Result<T>;
}

impl<T> TagErr<T> for Result<T> {
    fn tag_api(self) -> Result<T> {
        self.map_err(|err| {
            anyhow::Error::new(TaggedFailure {
                kind: error_kind::API,
                source: err.into(),
            })
        })
    }

    fn tag_db(self) -> Result<T> {
        self.map_err(|err| {
            anyhow::Error::new(TaggedFailure {
                kind: error_kind::DB,
                source: err.into(),
            })
        })
    }
}

fn tagged_kind(err: &anyhow::Error) -> Option<&'static str> {
    err.chain()
        .find_map(|c| c.downcast_ref::<TaggedFailure>())
        .map(|t| t.kind)
}

/// Bail out if the run's token has fired.
pub fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Canceled.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RunLifecycle
// ---------------------------------------------------------------------------

/// One sync_run from creation to its single terminal transition.
pub struct RunLifecycle {
    store: Arc<dyn Store>,
    reporter: Arc<dyn Reporter>,
    run_id: i64,
    source_kind: String,
    source_name: String,
    source_label: String,
    started: Instant,
    touched: Vec<EntityClass>,
}

impl RunLifecycle {
    /// Create the run row in `running` state. The source kind carries the
    /// mode suffix.
    pub async fn begin(deps: &IntegrationDeps, kind: &str, name: &str) -> Result<Self> {
        let source_kind = deps.mode.source_kind_for(kind);
        let run_id = deps
            .store
            .create_sync_run(&source_kind, name)
            .await
            .context("create sync run failed")
            .tag_db()?;

        Ok(Self {
            store: deps.store.clone(),
            reporter: deps.reporter.clone(),
            run_id,
            source_kind,
            source_name: name.to_string(),
            source_label: format!("{kind}/{name}"),
            started: Instant::now(),
            touched: Vec::new(),
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Mode-derived run source kind (e.g. `okta_discovery`).
    pub fn source_kind(&self) -> &str {
        &self.source_kind
    }

    pub fn source_label(&self) -> &str {
        &self.source_label
    }

    pub fn emit(&self, stage: &str, current: i64, total: i64) {
        self.reporter
            .report(Event::progress(self.source_label.clone(), stage, current, total));
    }

    /// Record that a class was written this run, so finalize promotes and
    /// expires it.
    pub fn touch(&mut self, class: EntityClass) {
        if !self.touched.contains(&class) {
            self.touched.push(class);
        }
    }

    /// One transaction: promote + expire every touched class, persist stats,
    /// mark success. On failure the run is recorded as a db failure and the
    /// error propagates.
    pub async fn finalize(self) -> Result<SyncStats> {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match self
            .store
            .finalize_sync_run(
                self.run_id,
                &self.source_kind,
                &self.source_name,
                &self.touched,
                duration_ms,
            )
            .await
        {
            Ok(stats) => {
                self.reporter
                    .report(Event::done(self.source_label.clone(), "finalize"));
                Ok(stats)
            }
            Err(err) => {
                let err = Err::<(), _>(err)
                    .context("finalize transaction failed")
                    .tag_db()
                    .unwrap_err();
                self.record_failure(&err).await;
                Err(err)
            }
        }
    }

    /// Record the terminal failure row. Classification: cancellation wins,
    /// then the failure-site tag, then `unknown`. The store bounds this
    /// write internally so a canceled pass still lands it.
    pub async fn record_failure(&self, err: &anyhow::Error) {
        let (status, kind) = if is_canceled(err) {
            (RunStatus::Canceled, error_kind::CONTEXT_CANCELED)
        } else {
            (RunStatus::Error, tagged_kind(err).unwrap_or(error_kind::UNKNOWN))
        };

        self.reporter.report(Event::failed(
            self.source_label.clone(),
            "sync",
            format!("{err:#}"),
        ));

        if let Err(persist_err) = self
            .store
            .fail_sync_run(self.run_id, status, &format!("{err:#}"), kind)
            .await
        {
            warn!(
                source = %self.source_label,
                run_id = self.run_id,
                error = %persist_err,
                "recording sync run failure itself failed"
            );
        }
    }
}

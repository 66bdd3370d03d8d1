//! In-process progress events and the reporter seam.

use chrono::{DateTime, Utc};

/// Sentinel for phases whose total is not known up front. Any total <= 0 is
/// treated as unknown.
pub const UNKNOWN_TOTAL: i64 = -1;

/// One progress record: `(source, stage, current, total, message, done, err, at)`.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: String,
    pub stage: String,
    pub current: i64,
    pub total: i64,
    pub message: String,
    pub done: bool,
    pub err: Option<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn progress(
        source: impl Into<String>,
        stage: impl Into<String>,
        current: i64,
        total: i64,
    ) -> Self {
        Self {
            source: source.into(),
            stage: stage.into(),
            current,
            total,
            message: String::new(),
            done: false,
            err: None,
            at: Utc::now(),
        }
    }

    pub fn message(
        source: impl Into<String>,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            stage: stage.into(),
            current: 0,
            total: 0,
            message: message.into(),
            done: false,
            err: None,
            at: Utc::now(),
        }
    }

    pub fn done(source: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stage: stage.into(),
            current: 0,
            total: 0,
            message: String::new(),
            done: true,
            err: None,
            at: Utc::now(),
        }
    }

    pub fn failed(
        source: impl Into<String>,
        stage: impl Into<String>,
        err: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            stage: stage.into(),
            current: 0,
            total: 0,
            message: String::new(),
            done: true,
            err: Some(err.into()),
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Goroutine-safe event sink. Implementations must tolerate concurrent
/// reports from every connector task in a pass.
pub trait Reporter: Send + Sync {
    fn report(&self, event: Event);
}

/// Discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _event: Event) {}
}

//! Throttled progress logging over the event stream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::event::{Event, Reporter};

#[derive(Debug, Clone)]
pub struct ProgressLogConfig {
    pub interval: Duration,
    pub percent_step: i64,
}

impl Default for ProgressLogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            percent_step: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    last_logged: Instant,
    last_percent: i64,
}

/// Logs events, suppressing mid-phase noise: a multi-step phase logs when
/// enough wall time has passed or enough percent progress accumulated since
/// the last line for that `(source, stage)`. Errors, completions, phase
/// boundaries, non-progress events and single-shot phases always log.
pub struct ProgressLogger {
    cfg: ProgressLogConfig,
    state: Mutex<HashMap<(String, String), ThrottleState>>,
}

impl ProgressLogger {
    pub fn new(cfg: ProgressLogConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn percent(event: &Event) -> i64 {
        if event.total <= 0 {
            return 0;
        }
        (event.current * 100) / event.total
    }

    /// Rules, in order; the first match decides.
    fn should_log(&self, event: &Event) -> bool {
        if event.err.is_some() || event.done {
            self.clear(event);
            return true;
        }
        // Non-progress event (plain message).
        if event.current == 0 && event.total == 0 {
            return true;
        }
        // Single-shot phase.
        if event.total == 1 {
            return true;
        }
        let key = (event.source.clone(), event.stage.clone());
        let percent = Self::percent(event);
        let now = Instant::now();

        // Unknown totals have no percent; throttle those by time alone.
        if event.total <= 0 {
            let mut state = self.state.lock().expect("progress state poisoned");
            let due = state
                .get(&key)
                .map_or(true, |prev| now.duration_since(prev.last_logged) >= self.cfg.interval);
            if due {
                state.insert(
                    key,
                    ThrottleState {
                        last_logged: now,
                        last_percent: 0,
                    },
                );
            }
            return due;
        }

        // Start of a multi-step phase: always log and seed the throttle
        // baseline at 0%.
        if event.current <= 0 {
            self.state
                .lock()
                .expect("progress state poisoned")
                .insert(
                    key,
                    ThrottleState {
                        last_logged: now,
                        last_percent: 0,
                    },
                );
            return true;
        }
        // End of a multi-step phase.
        if event.current >= event.total {
            self.clear(event);
            return true;
        }

        let mut state = self.state.lock().expect("progress state poisoned");
        match state.get(&key) {
            None => {
                state.insert(
                    key,
                    ThrottleState {
                        last_logged: now,
                        last_percent: percent,
                    },
                );
                true
            }
            Some(prev) => {
                let elapsed_enough = now.duration_since(prev.last_logged) >= self.cfg.interval;
                let progressed_enough = percent >= prev.last_percent + self.cfg.percent_step;
                if elapsed_enough || progressed_enough {
                    state.insert(
                        key,
                        ThrottleState {
                            last_logged: now,
                            last_percent: percent,
                        },
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    fn clear(&self, event: &Event) {
        let key = (event.source.clone(), event.stage.clone());
        self.state.lock().expect("progress state poisoned").remove(&key);
    }
}

impl Reporter for ProgressLogger {
    fn report(&self, event: Event) {
        if !self.should_log(&event) {
            return;
        }

        if let Some(err) = &event.err {
            error!(
                source = %event.source,
                stage = %event.stage,
                error = %err,
                "sync progress"
            );
            return;
        }

        info!(
            source = %event.source,
            stage = %event.stage,
            current = event.current,
            total = event.total,
            done = event.done,
            message = %event.message,
            "sync progress"
        );
    }
}

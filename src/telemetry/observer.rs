//! Observability handle passed to every engine component.
//!
//! Components never log through a global; they hold an
//! `Arc<dyn BenchmarkObserver>` given to their constructor. All methods have
//! no-op defaults so observers only implement what they care about.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::aggregate::{FailureReason, Outcome, RunSummary};
use crate::controller::{Location, Phase};
use crate::poller::PollResult;
use crate::target::Target;

/// Shared observer handle.
pub type SharedObserver = Arc<dyn BenchmarkObserver>;

/// A retry that is about to sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    /// Label of the operation being retried
    pub operation: &'a str,
    /// Attempt that just failed (1-indexed)
    pub attempt: u32,
    pub max_attempts: u32,
    /// Backoff before the next attempt
    pub delay: Duration,
    pub error: &'a str,
}

/// Receives engine events.
pub trait BenchmarkObserver: Send + Sync {
    /// A retryable failure occurred and the engine will retry after `delay`.
    fn on_retry(&self, event: &RetryEvent<'_>) {
        let _ = event;
    }

    /// An operation was classified fatal (non-retryable or out of attempts).
    fn on_fatal(&self, operation: &str, attempts: u32, error: &str) {
        let _ = (operation, attempts, error);
    }

    /// The poller observed a phase change.
    fn on_phase_change(&self, target: &Target, from: Option<&Phase>, to: &Phase, elapsed: Duration) {
        let _ = (target, from, to, elapsed);
    }

    /// The phase oracle failed; `fatal` tells whether polling stops.
    fn on_poll_error(&self, target: &Target, error: &str, fatal: bool) {
        let _ = (target, error, fatal);
    }

    /// The poller returned.
    fn on_poll_finished(&self, target: &Target, result: &PollResult) {
        let _ = (target, result);
    }

    /// Work for a target was handed to a worker.
    fn on_dispatch(&self, target: &Target) {
        let _ = target;
    }

    /// A worker produced an outcome.
    fn on_outcome(&self, outcome: &Outcome) {
        let _ = outcome;
    }

    /// A target was recorded without being dispatched.
    fn on_skipped(&self, target: &Target, reason: FailureReason) {
        let _ = (target, reason);
    }

    /// A migration attempt was triggered.
    fn on_migration_attempt(&self, target: &Target, attempt: u32, source: &Location) {
        let _ = (target, attempt, source);
    }

    /// A capacity-probe iteration finished.
    fn on_iteration_finished(&self, iteration: u32, summary: &RunSummary) {
        let _ = (iteration, summary);
    }
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BenchmarkObserver for NullObserver {}

/// Observer that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn shared() -> SharedObserver {
        Arc::new(TracingObserver)
    }
}

impl BenchmarkObserver for TracingObserver {
    fn on_retry(&self, event: &RetryEvent<'_>) {
        warn!(
            operation = event.operation,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            delay_secs = event.delay.as_secs_f64(),
            error = event.error,
            "Retryable error, backing off"
        );
    }

    fn on_fatal(&self, operation: &str, attempts: u32, error: &str) {
        error!(operation, attempts, error, "Operation failed");
    }

    fn on_phase_change(&self, target: &Target, from: Option<&Phase>, to: &Phase, elapsed: Duration) {
        debug!(
            target = %target,
            from = from.map(Phase::as_str).unwrap_or("-"),
            to = to.as_str(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Phase changed"
        );
    }

    fn on_poll_error(&self, target: &Target, error: &str, fatal: bool) {
        if fatal {
            error!(target = %target, error, "Status query failed");
        } else {
            debug!(target = %target, error, "Transient status query failure");
        }
    }

    fn on_poll_finished(&self, target: &Target, result: &PollResult) {
        info!(
            target = %target,
            classification = result.classification.as_str(),
            phase = result.final_phase.as_ref().map(Phase::as_str).unwrap_or("-"),
            elapsed_secs = result.elapsed.as_secs_f64(),
            "Poll finished"
        );
    }

    fn on_dispatch(&self, target: &Target) {
        debug!(target = %target, "Dispatching");
    }

    fn on_outcome(&self, outcome: &Outcome) {
        if outcome.success {
            info!(target = %outcome.target, "Completed");
        } else {
            warn!(
                target = %outcome.target,
                reason = outcome.failure_reason.map(|r| r.as_str()).unwrap_or("-"),
                message = outcome.message.as_deref().unwrap_or(""),
                "Failed"
            );
        }
    }

    fn on_skipped(&self, target: &Target, reason: FailureReason) {
        debug!(target = %target, reason = reason.as_str(), "Not dispatched");
    }

    fn on_migration_attempt(&self, target: &Target, attempt: u32, source: &Location) {
        info!(target = %target, attempt, source = %source, "Migration triggered");
    }

    fn on_iteration_finished(&self, iteration: u32, summary: &RunSummary) {
        info!(
            iteration,
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            terminal_reason = summary.terminal_reason.as_str(),
            "Iteration finished"
        );
    }
}

/// Fans events out to several observers.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<SharedObserver>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: SharedObserver) -> Self {
        self.observers.push(observer);
        self
    }
}

impl BenchmarkObserver for CompositeObserver {
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self.observers.iter().for_each(|o| o.on_retry(event));
    }

    fn on_fatal(&self, operation: &str, attempts: u32, error: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_fatal(operation, attempts, error));
    }

    fn on_phase_change(&self, target: &Target, from: Option<&Phase>, to: &Phase, elapsed: Duration) {
        self.observers
            .iter()
            .for_each(|o| o.on_phase_change(target, from, to, elapsed));
    }

    fn on_poll_error(&self, target: &Target, error: &str, fatal: bool) {
        self.observers
            .iter()
            .for_each(|o| o.on_poll_error(target, error, fatal));
    }

    fn on_poll_finished(&self, target: &Target, result: &PollResult) {
        self.observers
            .iter()
            .for_each(|o| o.on_poll_finished(target, result));
    }

    fn on_dispatch(&self, target: &Target) {
        self.observers.iter().for_each(|o| o.on_dispatch(target));
    }

    fn on_outcome(&self, outcome: &Outcome) {
        self.observers.iter().for_each(|o| o.on_outcome(outcome));
    }

    fn on_skipped(&self, target: &Target, reason: FailureReason) {
        self.observers.iter().for_each(|o| o.on_skipped(target, reason));
    }

    fn on_migration_attempt(&self, target: &Target, attempt: u32, source: &Location) {
        self.observers
            .iter()
            .for_each(|o| o.on_migration_attempt(target, attempt, source));
    }

    fn on_iteration_finished(&self, iteration: u32, summary: &RunSummary) {
        self.observers
            .iter()
            .for_each(|o| o.on_iteration_finished(iteration, summary));
    }
}

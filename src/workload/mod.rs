//! Workload drivers.
//!
//! Each driver enumerates its targets, hands them to a [`Dispatcher`] with a
//! per-phase work closure and returns a [`WorkloadReport`]. Drivers share a
//! [`WorkloadContext`] carrying the controller, the observer and the
//! cancellation token.

pub mod capacity;
pub mod cleanup;
pub mod creation;
pub mod migration;
pub mod phases;
pub mod recovery;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{summarize, FailureReason, Outcome, RunSummary, TerminalReason};
use crate::controller::ResourceController;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::poller::{PhaseVocabulary, PollResult, PollSettings, StatePoller};
use crate::report::{DetailRecord, SummaryRecord};
use crate::retry::{RetryEngine, RetryError, RetryPolicy};
use crate::target::{OperationKind, OperationRequest, Target};
use crate::telemetry::SharedObserver;

/// Handles shared by every phase of a workload.
#[derive(Clone)]
pub struct WorkloadContext {
    pub controller: Arc<dyn ResourceController>,
    pub observer: SharedObserver,
    pub cancel: CancellationToken,
    pub poll: PollSettings,
    pub retry: RetryPolicy,
}

impl WorkloadContext {
    pub fn new(
        controller: Arc<dyn ResourceController>,
        observer: SharedObserver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            observer,
            cancel,
            poll: PollSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dispatcher(&self, concurrency: usize) -> Dispatcher {
        Dispatcher::new(concurrency, self.observer.clone(), self.cancel.clone())
    }

    pub fn poller(&self, vocabulary: PhaseVocabulary) -> StatePoller {
        StatePoller::new(vocabulary, self.poll, self.observer.clone(), self.cancel.clone())
            .with_retry_policy(self.retry.clone())
    }

    pub fn retry_engine(&self) -> RetryEngine {
        RetryEngine::new(self.observer.clone(), self.cancel.clone())
    }

    /// A request for `target` under the context's retry policy.
    pub fn request(&self, target: Target, kind: OperationKind) -> OperationRequest {
        OperationRequest::new(target, kind, self.retry.clone())
    }

    /// Run the control-plane call behind `request` under the request's own
    /// retry policy.
    pub async fn submit<T, F, Fut>(&self, request: &OperationRequest, call: F) -> Result<T, RetryError<Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        self.retry_engine()
            .execute(request.retry_policy(), &request.label(), call)
            .await
    }
}

/// Outcome of a single poll, with the elapsed time recorded under `metric`
/// on success.
pub fn outcome_from_poll(target: Target, result: &PollResult, metric: &str) -> Outcome {
    match result.classification.failure_reason() {
        None => Outcome::succeeded(target).with_duration(metric, result.elapsed.as_secs_f64()),
        Some(reason) => {
            let message = result.message.clone().unwrap_or_else(|| {
                let phase = result
                    .final_phase
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "no phase observed".into());
                format!(
                    "{} after {:.1}s (last phase: {})",
                    result.classification.as_str(),
                    result.elapsed.as_secs_f64(),
                    phase
                )
            });
            Outcome::failed(target, reason, message)
        }
    }
}

/// Outcome of a control-plane call that never went through.
pub fn outcome_from_retry(target: Target, error: &RetryError<Error>) -> Outcome {
    let reason = if error.is_cancelled() {
        FailureReason::Interrupted
    } else {
        FailureReason::Error
    };
    Outcome::failed(target, reason, error.to_string())
}

/// Whether a batch of outcomes hit a stop condition.
pub(crate) fn phase_stops(outcomes: &[Outcome]) -> bool {
    summarize(outcomes).terminal_reason.stops_probe()
}

/// Fold a phase's outcomes into the per-target outcomes. Durations
/// accumulate; a failure replaces the target's status. Returns whether the
/// phase hit a stop condition.
pub(crate) fn merge_phase(results: &mut IndexMap<Target, Outcome>, outcomes: Vec<Outcome>) -> bool {
    let stops = phase_stops(&outcomes);
    for outcome in outcomes {
        let Some(existing) = results.get_mut(&outcome.target) else {
            continue;
        };
        existing.durations.extend(outcome.durations);
        existing.inferred_metrics.extend(outcome.inferred_metrics);
        if !outcome.success {
            existing.success = false;
            existing.failure_reason = outcome.failure_reason;
            existing.message = outcome.message;
        }
    }
    stops
}

/// Targets whose outcome is still successful.
pub(crate) fn healthy(results: &IndexMap<Target, Outcome>) -> Vec<Target> {
    results
        .values()
        .filter(|o| o.success)
        .map(|o| o.target.clone())
        .collect()
}

/// Everything a finished workload hands back.
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub workload: String,
    pub outcomes: Vec<Outcome>,
    pub summary: RunSummary,
    pub started_at: DateTime<Utc>,
    pub duration_sec: f64,
}

impl WorkloadReport {
    pub fn new(
        workload: impl Into<String>,
        outcomes: Vec<Outcome>,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> Self {
        let summary = summarize(&outcomes);
        Self::with_summary(workload, outcomes, summary, started_at, started)
    }

    /// Report whose summary was built elsewhere, e.g. folded across probe
    /// iterations.
    pub fn with_summary(
        workload: impl Into<String>,
        outcomes: Vec<Outcome>,
        summary: RunSummary,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> Self {
        Self {
            workload: workload.into(),
            outcomes,
            summary,
            started_at,
            duration_sec: started.elapsed().as_secs_f64(),
        }
    }

    pub fn details(&self) -> Vec<DetailRecord> {
        self.outcomes.iter().map(DetailRecord::from).collect()
    }

    pub fn summary_record(&self) -> SummaryRecord {
        SummaryRecord::new(&self.workload, &self.summary, self.started_at, self.duration_sec)
    }

    /// 130 on interruption, 1 when anything failed for a reason other than
    /// exhaustion, otherwise 0.
    pub fn exit_code(&self) -> i32 {
        exit_code_for(&self.summary)
    }
}

pub fn exit_code_for(summary: &RunSummary) -> i32 {
    if summary.terminal_reason == TerminalReason::Interrupted {
        130
    } else if summary.has_unexpected_failures() {
        1
    } else {
        0
    }
}

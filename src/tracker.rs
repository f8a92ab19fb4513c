//! Duration measurement for operations the control plane also timestamps.
//!
//! A live migration is measured twice: the *observed* duration is wall-clock
//! time from triggering until the placement changes, polled by us; the
//! *authoritative* duration comes from the start/end timestamps on the
//! migration object. Both are reported. When the start timestamp is missing
//! but the end is present, the start is inferred as `end - poll_interval`
//! and the measurement is flagged as inferred.
//!
//! [`InferredSpan`] applies the same inference to phase-only operations
//! such as volume clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::FailureReason;
use crate::controller::{
    Location, MigrationHandle, MigrationTimestamps, Phase, ResourceController,
};
use crate::retry::RetryEngine;
use crate::target::{OperationRequest, ResourceKind};
use crate::telemetry::SharedObserver;

/// Both durations of one migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMeasurement {
    pub observed_duration_sec: f64,
    pub authoritative_duration_sec: Option<f64>,
    pub authoritative_start_inferred: bool,
    pub source: Location,
    pub destination: Location,
    /// Operation-level attempts used
    pub attempts: u32,
}

impl MigrationMeasurement {
    /// `observed - authoritative`, roughly one poll interval of overhead.
    pub fn overhead_sec(&self) -> Option<f64> {
        self.authoritative_duration_sec
            .map(|authoritative| self.observed_duration_sec - authoritative)
    }
}

/// A migration that did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFailure {
    pub reason: FailureReason,
    pub message: String,
    pub source: Option<Location>,
    pub observed_duration_sec: f64,
    pub attempts: u32,
}

/// Authoritative duration from a timestamp pair.
///
/// Returns `(duration, start_inferred)`.
pub fn reconcile_timestamps(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    poll_interval: Duration,
) -> (Option<f64>, bool) {
    match (start, end) {
        (Some(start), Some(end)) => {
            let millis = (end - start).num_milliseconds();
            (Some(millis as f64 / 1000.0), false)
        }
        (None, Some(end)) => {
            let interval = chrono::Duration::from_std(poll_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let inferred_start = end - interval;
            let millis = (end - inferred_start).num_milliseconds();
            (Some(millis as f64 / 1000.0), true)
        }
        _ => (None, false),
    }
}

/// Timing knobs for migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSettings {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Whole-operation attempts after a failed migration phase
    pub max_operation_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            max_operation_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

enum AttemptResult {
    Completed(MigrationMeasurement),
    FailedPhase { message: String, observed_sec: f64 },
    Failed(MigrationFailure),
}

/// Request parameter naming the requested destination.
pub const PARAM_DESTINATION: &str = "destination";

/// Measures live migrations with dual timestamps.
#[derive(Clone)]
pub struct MigrationTracker {
    controller: Arc<dyn ResourceController>,
    retry: RetryEngine,
    settings: MigrationSettings,
    failure_phases: HashSet<Phase>,
    observer: SharedObserver,
    cancel: CancellationToken,
}

impl MigrationTracker {
    pub fn new(
        controller: Arc<dyn ResourceController>,
        settings: MigrationSettings,
        observer: SharedObserver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            retry: RetryEngine::new(observer.clone(), cancel.clone()),
            controller,
            settings,
            failure_phases: crate::controller::phases(["Failed"]),
            observer,
            cancel,
        }
    }

    /// Phases of the migration object that count as failed.
    pub fn with_failure_phases(mut self, phases: HashSet<Phase>) -> Self {
        self.failure_phases = phases;
        self
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    /// Trigger the migration described by `request` and measure it.
    ///
    /// The request's retry policy governs the trigger call; its
    /// `destination` parameter, when present, is passed on as a hint.
    pub async fn measure(&self, request: &OperationRequest) -> Result<MigrationMeasurement, MigrationFailure> {
        let target = request.target();
        let dest_hint = request.parameter(PARAM_DESTINATION).map(Location::new);
        let mut source = match self.controller.placement(target).await {
            Ok(Some(location)) => location,
            Ok(None) => {
                return Err(self.failure(FailureReason::Error, "target is not placed on any location", None, 0.0, 0));
            }
            Err(e) => {
                return Err(self.failure(FailureReason::Error, e.to_string(), None, 0.0, 0));
            }
        };

        let max_attempts = self.settings.max_operation_attempts.max(1);
        let mut last_message = String::new();
        let mut last_observed = 0.0;

        for attempt in 1..=max_attempts {
            self.observer.on_migration_attempt(target, attempt, &source);

            match self.attempt(request, dest_hint.as_ref(), &source, attempt).await {
                AttemptResult::Completed(measurement) => return Ok(measurement),
                AttemptResult::Failed(failure) => return Err(failure),
                AttemptResult::FailedPhase { message, observed_sec } => {
                    last_message = message;
                    last_observed = observed_sec;
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(self.failure(
                        FailureReason::Interrupted,
                        "cancelled between attempts",
                        Some(source),
                        last_observed,
                        attempt,
                    ));
                }
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }

            // The VM may have partially moved; measure the next attempt from
            // wherever it is now.
            if let Ok(Some(current)) = self.controller.placement(target).await {
                source = current;
            }
        }

        Err(self.failure(
            FailureReason::Error,
            format!("migration failed after {} attempt(s): {}", max_attempts, last_message),
            Some(source),
            last_observed,
            max_attempts,
        ))
    }

    async fn attempt(
        &self,
        request: &OperationRequest,
        dest_hint: Option<&Location>,
        source: &Location,
        attempt: u32,
    ) -> AttemptResult {
        let target = request.target();
        let handle = match self
            .retry
            .execute(request.retry_policy(), &request.label(), || self.controller.migrate(target, dest_hint))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let reason = if e.is_cancelled() {
                    FailureReason::Interrupted
                } else {
                    FailureReason::Error
                };
                return AttemptResult::Failed(self.failure(reason, e.to_string(), Some(source.clone()), 0.0, attempt));
            }
        };

        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                let observed = started.elapsed().as_secs_f64();
                return AttemptResult::Failed(self.failure(
                    FailureReason::Interrupted,
                    "cancelled",
                    Some(source.clone()),
                    observed,
                    attempt,
                ));
            }

            if let Ok(Some(current)) = self.controller.placement(target).await {
                if &current != source {
                    let observed = started.elapsed().as_secs_f64();
                    let timestamps = match self.controller.migration_timestamps(&handle).await {
                        Ok(timestamps) => timestamps,
                        Err(e) => {
                            tracing::warn!(
                                target = %target,
                                migration = %handle.name,
                                error = %e,
                                "Failed to read migration timestamps"
                            );
                            MigrationTimestamps::absent()
                        }
                    };
                    let (authoritative, inferred) = reconcile_timestamps(
                        timestamps.start,
                        timestamps.end,
                        self.settings.poll_interval,
                    );
                    return AttemptResult::Completed(MigrationMeasurement {
                        observed_duration_sec: observed,
                        authoritative_duration_sec: authoritative,
                        authoritative_start_inferred: inferred,
                        source: source.clone(),
                        destination: current,
                        attempts: attempt,
                    });
                }
            }

            if let Ok(timestamps) = self.controller.migration_timestamps(&handle).await {
                if self.failure_phases.contains(&timestamps.phase) {
                    let observed_sec = started.elapsed().as_secs_f64();
                    self.cleanup(&handle).await;
                    return AttemptResult::FailedPhase {
                        message: format!("{} reported phase {}", handle.name, timestamps.phase),
                        observed_sec,
                    };
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.timeout {
                return AttemptResult::Failed(self.failure(
                    FailureReason::Timeout,
                    format!("placement unchanged after {:?}", self.settings.timeout),
                    Some(source.clone()),
                    elapsed.as_secs_f64(),
                    attempt,
                ));
            }

            let wait = self
                .settings
                .poll_interval
                .min(self.settings.timeout - elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn cleanup(&self, handle: &MigrationHandle) {
        let object = handle.target.related(handle.name.clone(), ResourceKind::Migration);
        if let Err(e) = self.controller.delete(&object).await {
            tracing::debug!(migration = %handle.name, error = %e, "Failed to delete migration object");
        }
    }

    fn failure(
        &self,
        reason: FailureReason,
        message: impl Into<String>,
        source: Option<Location>,
        observed_duration_sec: f64,
        attempts: u32,
    ) -> MigrationFailure {
        MigrationFailure {
            reason,
            message: message.into(),
            source,
            observed_duration_sec,
            attempts,
        }
    }
}

/// Span of a phase-only operation, with start inference.
///
/// Feed every sample to [`observe`](Self::observe). The start is the first
/// sample in a start phase; if the operation is first seen already in
/// progress or finished, the start is inferred one poll interval earlier.
#[derive(Debug, Clone)]
pub struct InferredSpan {
    start_phases: HashSet<Phase>,
    progress_phases: HashSet<Phase>,
    end_phases: HashSet<Phase>,
    poll_interval: Duration,
    start: Option<Instant>,
    end: Option<Instant>,
    inferred: bool,
}

impl InferredSpan {
    pub fn new(
        start_phases: HashSet<Phase>,
        progress_phases: HashSet<Phase>,
        end_phases: HashSet<Phase>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            start_phases,
            progress_phases,
            end_phases,
            poll_interval,
            start: None,
            end: None,
            inferred: false,
        }
    }

    pub fn observe(&mut self, phase: &Phase, now: Instant) {
        if self.end.is_some() {
            return;
        }
        if self.start.is_none() {
            if self.start_phases.contains(phase) {
                self.start = Some(now);
            } else if self.progress_phases.contains(phase) || self.end_phases.contains(phase) {
                self.start = Some(now.checked_sub(self.poll_interval).unwrap_or(now));
                self.inferred = true;
            }
        }
        if self.end_phases.contains(phase) {
            self.end = Some(now);
        }
    }

    /// Duration in seconds once both ends are known.
    pub fn duration(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end.duration_since(start).as_secs_f64()),
            _ => None,
        }
    }

    pub fn is_inferred(&self) -> bool {
        self.inferred
    }
}

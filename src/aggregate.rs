//! Per-target outcomes and their aggregation.
//!
//! Aggregation is over an unordered multiset of outcomes, so everything in
//! [`RunSummary`] is built from associative operations (count, sum, min,
//! max, highest-priority terminal reason). Concurrent producers never write
//! into a summary directly: they send outcomes to the single
//! [`Aggregator`] task.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::controller::Location;
use crate::target::Target;

/// Why a target did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    Error,
    CapacityExhausted,
    Timeout,
    Interrupted,
    Skipped,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Error => "error",
            FailureReason::CapacityExhausted => "capacityExhausted",
            FailureReason::Timeout => "timeout",
            FailureReason::Interrupted => "interrupted",
            FailureReason::Skipped => "skipped",
        }
    }

    /// Failures that make the process exit nonzero.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            FailureReason::Error | FailureReason::Timeout | FailureReason::Interrupted
        )
    }
}

/// Terminal record for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub target: Target,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
    /// Seconds per metric name
    pub durations: IndexMap<String, f64>,
    pub source_location: Option<Location>,
    pub dest_location: Option<Location>,
    /// Metrics whose start time was inferred rather than observed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inferred_metrics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Outcome {
    pub fn succeeded(target: Target) -> Self {
        Self {
            target,
            success: true,
            failure_reason: None,
            durations: IndexMap::new(),
            source_location: None,
            dest_location: None,
            inferred_metrics: Vec::new(),
            message: None,
        }
    }

    pub fn failed(target: Target, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
            message: Some(message.into()),
            ..Self::succeeded(target)
        }
    }

    /// A target recorded without ever being dispatched.
    pub fn not_dispatched(target: Target, reason: FailureReason) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
            ..Self::succeeded(target)
        }
    }

    pub fn with_duration(mut self, metric: impl Into<String>, seconds: f64) -> Self {
        self.durations.insert(metric.into(), seconds);
        self
    }

    pub fn with_locations(mut self, source: Option<Location>, dest: Option<Location>) -> Self {
        self.source_location = source;
        self.dest_location = dest;
        self
    }

    pub fn with_inferred(mut self, metric: impl Into<String>) -> Self {
        self.inferred_metrics.push(metric.into());
        self
    }

    pub fn has_reason(&self, reason: FailureReason) -> bool {
        self.failure_reason == Some(reason)
    }

    pub fn is_capacity_exhausted(&self) -> bool {
        self.has_reason(FailureReason::CapacityExhausted)
    }

    pub fn is_skipped(&self) -> bool {
        self.has_reason(FailureReason::Skipped)
    }
}

/// count/sum/min/max for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricStats {
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &MetricStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Why a run or iteration stopped. Variants are ordered by priority, lowest
/// first; combining reasons keeps the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalReason {
    #[default]
    NormalCompletion,
    LimitReached,
    Timeout,
    Error,
    CapacityExhausted,
    Interrupted,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::NormalCompletion => "normalCompletion",
            TerminalReason::LimitReached => "limitReached",
            TerminalReason::Timeout => "timeout",
            TerminalReason::Error => "error",
            TerminalReason::CapacityExhausted => "capacityExhausted",
            TerminalReason::Interrupted => "interrupted",
        }
    }

    pub fn from_failure(reason: FailureReason) -> Option<Self> {
        match reason {
            FailureReason::Error => Some(TerminalReason::Error),
            FailureReason::CapacityExhausted => Some(TerminalReason::CapacityExhausted),
            FailureReason::Timeout => Some(TerminalReason::Timeout),
            FailureReason::Interrupted => Some(TerminalReason::Interrupted),
            FailureReason::Skipped => None,
        }
    }

    /// Reasons that end a capacity probe.
    pub fn stops_probe(&self) -> bool {
        matches!(
            self,
            TerminalReason::CapacityExhausted
                | TerminalReason::Error
                | TerminalReason::Timeout
                | TerminalReason::Interrupted
        )
    }
}

/// Aggregate of a list of outcomes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    /// Dispatched targets that did not succeed
    pub failed: usize,
    /// Targets never dispatched
    pub skipped: usize,
    pub per_metric: IndexMap<String, MetricStats>,
    pub failures_by_reason: BTreeMap<FailureReason, usize>,
    pub terminal_reason: TerminalReason,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one outcome.
    pub fn record(&mut self, outcome: &Outcome) {
        self.total += 1;

        if outcome.success {
            self.successful += 1;
            for (metric, value) in &outcome.durations {
                match self.per_metric.get_mut(metric) {
                    Some(stats) => stats.record(*value),
                    None => {
                        self.per_metric.insert(metric.clone(), MetricStats::new(*value));
                    }
                }
            }
            return;
        }

        let reason = outcome.failure_reason.unwrap_or(FailureReason::Error);
        if reason == FailureReason::Skipped {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
        *self.failures_by_reason.entry(reason).or_insert(0) += 1;
        if let Some(terminal) = TerminalReason::from_failure(reason) {
            self.raise(terminal);
        }
    }

    /// Add a batch of outcomes.
    pub fn fold(&mut self, outcomes: &[Outcome]) {
        for outcome in outcomes {
            self.record(outcome);
        }
    }

    /// Combine two summaries.
    pub fn merge(&mut self, other: &RunSummary) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
        self.skipped += other.skipped;
        for (metric, stats) in &other.per_metric {
            match self.per_metric.get_mut(metric) {
                Some(existing) => existing.merge(stats),
                None => {
                    self.per_metric.insert(metric.clone(), *stats);
                }
            }
        }
        for (reason, count) in &other.failures_by_reason {
            *self.failures_by_reason.entry(*reason).or_insert(0) += count;
        }
        self.raise(other.terminal_reason);
    }

    /// Raise the terminal reason if `reason` has higher priority.
    pub fn raise(&mut self, reason: TerminalReason) {
        self.terminal_reason = self.terminal_reason.max(reason);
    }

    pub fn mark_limit_reached(&mut self) {
        self.raise(TerminalReason::LimitReached);
    }

    pub fn mark_interrupted(&mut self) {
        self.raise(TerminalReason::Interrupted);
    }

    pub fn failures(&self, reason: FailureReason) -> usize {
        self.failures_by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// True when some target failed for a reason other than exhaustion.
    pub fn has_unexpected_failures(&self) -> bool {
        self.failures_by_reason
            .iter()
            .any(|(reason, count)| reason.is_unexpected() && *count > 0)
    }
}

/// Summarize a list of outcomes.
pub fn summarize(outcomes: &[Outcome]) -> RunSummary {
    let mut summary = RunSummary::new();
    summary.fold(outcomes);
    summary
}

/// Fold a batch of outcomes into an existing summary.
pub fn fold(mut into: RunSummary, outcomes: &[Outcome]) -> RunSummary {
    into.fold(outcomes);
    into
}

/// Outcomes plus their summary, as collected by the aggregation task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateReport {
    pub summary: RunSummary,
    pub outcomes: Vec<Outcome>,
}

/// Sending side of the aggregation task.
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<Outcome>,
}

impl AggregatorHandle {
    /// Queue an outcome. Returns false when the aggregator has stopped.
    pub async fn record(&self, outcome: Outcome) -> bool {
        self.tx.send(outcome).await.is_ok()
    }
}

/// Single-writer accumulator fed over a channel.
pub struct Aggregator;

impl Aggregator {
    /// Spawn the aggregation task. It finishes once every handle is dropped.
    pub fn spawn(capacity: usize) -> (AggregatorHandle, JoinHandle<AggregateReport>) {
        let (tx, mut rx) = mpsc::channel::<Outcome>(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut report = AggregateReport::default();
            while let Some(outcome) = rx.recv().await {
                report.summary.record(&outcome);
                report.outcomes.push(outcome);
            }
            report
        });
        (AggregatorHandle { tx }, task)
    }
}

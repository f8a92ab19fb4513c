//! Capacity probing: repeat batches until the platform runs out.
//!
//! Each iteration dispatches a batch, summarizes it and folds it into the
//! cumulative summary. The loop ends when an iteration's terminal reason is
//! exhaustion, error, timeout or interruption, or when the iteration cap is
//! hit. Resources from earlier iterations are left in place.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{summarize, Outcome, RunSummary, TerminalReason};
use crate::telemetry::SharedObserver;

/// Loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// `None` runs until a stop condition
    pub max_iterations: Option<u32>,
    /// Pause between iterations
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_iterations: None,
            pause: Duration::from_secs(5),
        }
    }
}

/// One iteration's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub duration_sec: f64,
    pub summary: RunSummary,
}

/// Result of a whole probe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub iterations: Vec<IterationRecord>,
    pub cumulative: RunSummary,
    pub end_reason: TerminalReason,
}

impl ProbeReport {
    /// Iterations that finished without any stop condition.
    pub fn iterations_completed(&self) -> usize {
        self.iterations
            .iter()
            .filter(|i| i.summary.terminal_reason == TerminalReason::NormalCompletion)
            .count()
    }

    pub fn capacity_reached(&self) -> bool {
        self.end_reason == TerminalReason::CapacityExhausted
    }
}

/// Outer loop of capacity-probing workloads.
pub struct CapacityProbe {
    settings: ProbeSettings,
    observer: SharedObserver,
    cancel: CancellationToken,
}

impl CapacityProbe {
    pub fn new(settings: ProbeSettings, observer: SharedObserver, cancel: CancellationToken) -> Self {
        Self {
            settings,
            observer,
            cancel,
        }
    }

    /// Run `batch(iteration)` (1-indexed) until a stop condition.
    pub async fn run<F, Fut>(&self, mut batch: F) -> ProbeReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Vec<Outcome>>,
    {
        let mut report = ProbeReport::default();
        let mut iteration = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                report.cumulative.mark_interrupted();
                break;
            }
            if self.limit_reached(iteration) {
                report.cumulative.mark_limit_reached();
                break;
            }

            iteration += 1;
            let started = Instant::now();
            let outcomes = batch(iteration).await;
            let summary = summarize(&outcomes);
            report.cumulative.fold(&outcomes);
            self.observer.on_iteration_finished(iteration, &summary);

            let stop = summary.terminal_reason.stops_probe();
            report.iterations.push(IterationRecord {
                iteration,
                duration_sec: started.elapsed().as_secs_f64(),
                summary,
            });
            if stop {
                break;
            }
            if self.limit_reached(iteration) {
                report.cumulative.mark_limit_reached();
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    report.cumulative.mark_interrupted();
                    break;
                }
                _ = tokio::time::sleep(self.settings.pause) => {}
            }
        }

        report.end_reason = report.cumulative.terminal_reason;
        report
    }

    fn limit_reached(&self, iterations_run: u32) -> bool {
        self.settings
            .max_iterations
            .is_some_and(|max| iterations_run >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::FailureReason;
    use crate::target::Target;
    use crate::telemetry::NullObserver;
    use std::sync::Arc;

    fn probe(max: Option<u32>, cancel: CancellationToken) -> CapacityProbe {
        CapacityProbe::new(
            ProbeSettings {
                max_iterations: max,
                pause: Duration::from_secs(5),
            },
            Arc::new(NullObserver),
            cancel,
        )
    }

    fn batch(iteration: u32, exhaust_on: u32) -> Vec<Outcome> {
        (1..=3)
            .map(|i| {
                let target = Target::vm(format!("vm-{}-{}", iteration, i), "capacity");
                if iteration == exhaust_on && i == 3 {
                    Outcome::failed(target, FailureReason::CapacityExhausted, "Scheduling")
                } else {
                    Outcome::succeeded(target).with_duration("running", 10.0)
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_exhaustion_and_accumulates() {
        let report = probe(None, CancellationToken::new())
            .run(|i| async move { batch(i, 3) })
            .await;
        assert_eq!(report.iterations.len(), 3);
        assert_eq!(report.iterations_completed(), 2);
        assert!(report.capacity_reached());
        assert_eq!(report.cumulative.total, 9);
        assert_eq!(report.cumulative.successful, 8);
        assert_eq!(report.cumulative.per_metric["running"].count, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap() {
        let report = probe(Some(2), CancellationToken::new())
            .run(|i| async move { batch(i, 99) })
            .await;
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.end_reason, TerminalReason::LimitReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pause_after_last_iteration() {
        let started = Instant::now();
        let report = probe(Some(2), CancellationToken::new())
            .run(|i| async move { batch(i, 99) })
            .await;
        assert_eq!(report.end_reason, TerminalReason::LimitReached);
        // One pause between the two iterations, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_iteration_cap_runs_nothing() {
        let report = probe(Some(0), CancellationToken::new())
            .run(|i| async move { batch(i, 99) })
            .await;
        assert!(report.iterations.is_empty());
        assert_eq!(report.end_reason, TerminalReason::LimitReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_stops_probe() {
        let report = probe(None, CancellationToken::new())
            .run(|i| async move {
                vec![Outcome::failed(
                    Target::vm(format!("vm-{}", i), "capacity"),
                    FailureReason::Error,
                    "ErrImagePull",
                )]
            })
            .await;
        assert_eq!(report.iterations.len(), 1);
        assert_eq!(report.end_reason, TerminalReason::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_pause() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            c.cancel();
        });
        let report = probe(None, cancel)
            .run(|i| async move { batch(i, 99) })
            .await;
        assert_eq!(report.iterations.len(), 1);
        assert_eq!(report.end_reason, TerminalReason::Interrupted);
    }
}

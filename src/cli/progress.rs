//! Progress display for workload runs
//!
//! [`ProgressObserver`] plugs into the engine's observer seam and drives an
//! indicatif bar: every dispatched operation grows the bar, every outcome
//! advances it.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use virtbench::aggregate::{FailureReason, Outcome, RunSummary};
use virtbench::target::Target;
use virtbench::telemetry::{BenchmarkObserver, SharedObserver};

/// Observer rendering a live operation counter.
pub struct ProgressObserver {
    bar: ProgressBar,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl ProgressObserver {
    /// Create a progress observer; hidden when `visible` is false (JSON mode)
    pub fn new(prefix: &str, visible: bool) -> Self {
        let bar = ProgressBar::new(0);
        if visible {
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ops {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_prefix(prefix.to_string());

        Self {
            bar,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn shared(prefix: &str, visible: bool) -> Arc<Self> {
        Arc::new(Self::new(prefix, visible))
    }

    /// Erase the bar before the summary is printed
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn counts(&self) -> (u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    fn refresh_message(&self) {
        let (ok, failed) = self.counts();
        let message = if failed > 0 {
            format!("{} ok, {}", ok, format!("{} failed", failed).red())
        } else {
            format!("{} ok", ok).green().to_string()
        };
        self.bar.set_message(message);
    }
}

impl BenchmarkObserver for ProgressObserver {
    fn on_dispatch(&self, _target: &Target) {
        self.bar.inc_length(1);
    }

    fn on_outcome(&self, outcome: &Outcome) {
        if outcome.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bar.inc(1);
        self.refresh_message();
    }

    fn on_skipped(&self, _target: &Target, _reason: FailureReason) {
        self.bar.inc_length(1);
        self.bar.inc(1);
    }

    fn on_iteration_finished(&self, iteration: u32, summary: &RunSummary) {
        self.bar.println(format!(
            "iteration {}: {} of {} succeeded ({})",
            iteration,
            summary.successful,
            summary.total,
            summary.terminal_reason.as_str()
        ));
    }
}

/// Upcast for composing with other observers
pub fn as_shared(progress: &Arc<ProgressObserver>) -> SharedObserver {
    Arc::clone(progress) as SharedObserver
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_outcomes() {
        let progress = ProgressObserver::new("test", false);
        let target = Target::vm("vm-1", "ns-1");

        progress.on_dispatch(&target);
        progress.on_dispatch(&target);
        progress.on_outcome(&Outcome::succeeded(target.clone()));
        progress.on_outcome(&Outcome::failed(target.clone(), FailureReason::Timeout, "slow"));
        progress.on_skipped(&target, FailureReason::Skipped);

        assert_eq!(progress.counts(), (1, 1));
        assert_eq!(progress.bar.position(), 3);
        assert_eq!(progress.bar.length(), Some(3));
    }
}

//! Failure-recovery workload.
//!
//! Run right after a node failure has been triggered. Every VM instance in
//! the range is polled until it runs again with its Ready condition true and
//! an address assigned. All durations share one start time, taken when the
//! workload begins, so they read as time-to-recovery from the failure.
//!
//! Optionally the failed node is uncordoned once every instance is back.
//!
//! Metric: `recovery`.

use chrono::Utc;
use tokio::time::Instant;

use super::{outcome_from_poll, phases, WorkloadContext, WorkloadReport};
use crate::aggregate::Outcome;
use crate::controller::Location;
use crate::dispatcher::never_stop;
use crate::error::Result;
use crate::target::{ResourceKind, Target, TargetRange};

/// Inputs of a recovery run.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub range: TargetRange,
    pub concurrency: usize,
    /// Node to uncordon after measuring
    pub failed_node: Option<Location>,
}

impl RecoverySettings {
    pub fn new(range: TargetRange) -> Self {
        Self {
            range,
            concurrency: 50,
            failed_node: None,
        }
    }

    /// The instance behind each VM in the range.
    pub fn instances(&self) -> Vec<Target> {
        self.range
            .targets()
            .into_iter()
            .map(|vm| vm.related(vm.id.clone(), ResourceKind::Instance))
            .collect()
    }
}

/// Run the recovery workload.
pub async fn run(ctx: &WorkloadContext, settings: &RecoverySettings) -> Result<WorkloadReport> {
    let started_at = Utc::now();
    let started = Instant::now();
    let instances = settings.instances();
    tracing::info!(
        instances = instances.len(),
        concurrency = settings.concurrency,
        "Monitoring instance recovery"
    );

    let work_ctx = ctx.clone();
    let work = move |target: Target| {
        let ctx = work_ctx.clone();
        async move { await_recovery(&ctx, target, started).await }
    };
    let outcomes = ctx
        .dispatcher(settings.concurrency)
        .run_all(instances, work, never_stop)
        .await;

    let report = WorkloadReport::new("recovery", outcomes, started_at, started);
    if let Some(node) = &settings.failed_node {
        uncordon(ctx, node).await;
    }
    Ok(report)
}

/// Poll one instance back into service, timed from the shared start.
pub async fn await_recovery(ctx: &WorkloadContext, target: Target, since: Instant) -> Outcome {
    let result = ctx
        .poller(phases::instance_recovered())
        .await_phase_since(&target, since, || ctx.controller.status(&target))
        .await;
    outcome_from_poll(target, &result, "recovery")
}

async fn uncordon(ctx: &WorkloadContext, node: &Location) {
    let label = format!("uncordon {}", node);
    let result = ctx
        .retry_engine()
        .execute(&ctx.retry, &label, || ctx.controller.uncordon(node))
        .await;
    if let Err(e) = result {
        tracing::warn!(node = %node, error = %e, "Failed to uncordon node");
    }
}

//! Live-migration workload.
//!
//! VMs are expected to be running already (the CLI can run the creation
//! workload first). Each selected VM is migrated through the
//! [`MigrationTracker`], which reports both the observed and the
//! authoritative duration.
//!
//! Metrics: `observed`, `authoritative` and `overhead`.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::time::Instant;

use super::{phases, WorkloadContext, WorkloadReport};
use crate::aggregate::Outcome;
use crate::controller::Location;
use crate::dispatcher::{never_stop, DispatchOrder};
use crate::error::{Error, Result};
use crate::target::{OperationKind, OperationRequest, Target, TargetRange};
use crate::tracker::{MigrationMeasurement, MigrationSettings, MigrationTracker, PARAM_DESTINATION};

/// How the selected VMs are migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationMode {
    /// One at a time.
    Sequential,
    /// Bounded-parallel, optionally interleaved across worker nodes.
    Parallel { interleave: bool },
    /// Every VM on one node, in parallel. `None` picks the node running the
    /// most targets.
    Evacuate { source: Option<Location> },
}

impl MigrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationMode::Sequential => "sequential",
            MigrationMode::Parallel { .. } => "parallel",
            MigrationMode::Evacuate { .. } => "evacuate",
        }
    }
}

/// Inputs of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationWorkloadSettings {
    pub range: TargetRange,
    pub mode: MigrationMode,
    pub concurrency: usize,
    /// Only migrate VMs currently on this node
    pub source_node: Option<Location>,
    /// Destination request; KubeVirt picks the node itself
    pub target_node: Option<Location>,
    pub tracker: MigrationSettings,
}

impl MigrationWorkloadSettings {
    pub fn new(range: TargetRange, mode: MigrationMode) -> Self {
        Self {
            range,
            mode,
            concurrency: 10,
            source_node: None,
            target_node: None,
            tracker: MigrationSettings::default(),
        }
    }
}

/// Run the migration workload.
pub async fn run(ctx: &WorkloadContext, settings: &MigrationWorkloadSettings) -> Result<WorkloadReport> {
    let started_at = Utc::now();
    let started = Instant::now();

    let placements = current_placements(ctx, settings.range.targets(), settings.concurrency).await;
    let targets = select_targets(&placements, settings)?;

    if let Some(node) = &settings.target_node {
        tracing::warn!(
            node = %node,
            "Target node requested but KubeVirt chooses the destination; the hint is only logged"
        );
    }

    let dispatcher = match &settings.mode {
        MigrationMode::Sequential => ctx.dispatcher(1),
        MigrationMode::Parallel { interleave: true } => {
            let groups = ctx.controller.locations().await.map(|l| l.len()).unwrap_or(1);
            tracing::info!(nodes = groups, "Interleaving migrations across nodes");
            ctx.dispatcher(settings.concurrency)
                .with_order(DispatchOrder::Interleaved { groups })
        }
        MigrationMode::Parallel { interleave: false } | MigrationMode::Evacuate { .. } => {
            ctx.dispatcher(settings.concurrency)
        }
    };

    tracing::info!(
        mode = settings.mode.as_str(),
        targets = targets.len(),
        concurrency = dispatcher.concurrency(),
        "Migrating VMs"
    );

    let tracker = Arc::new(
        MigrationTracker::new(
            Arc::clone(&ctx.controller),
            settings.tracker,
            ctx.observer.clone(),
            ctx.cancel.clone(),
        )
        .with_failure_phases(phases::migration_failed()),
    );
    let requests: Vec<OperationRequest> = targets
        .into_iter()
        .map(|target| {
            let request = ctx.request(target, OperationKind::Migrate);
            match &settings.target_node {
                Some(node) => request.with_parameter(PARAM_DESTINATION, node.as_str()),
                None => request,
            }
        })
        .collect();
    let work = move |request: OperationRequest| {
        let tracker = Arc::clone(&tracker);
        async move {
            let target = request.target().clone();
            match tracker.measure(&request).await {
                Ok(measurement) => measurement_outcome(target, &measurement),
                Err(failure) => {
                    let mut outcome = Outcome::failed(target, failure.reason, failure.message)
                        .with_locations(failure.source, None);
                    if failure.observed_duration_sec > 0.0 {
                        outcome = outcome.with_duration("observed", failure.observed_duration_sec);
                    }
                    outcome
                }
            }
        }
    };

    let outcomes = dispatcher.run_all(requests, work, never_stop).await;
    Ok(WorkloadReport::new("migration", outcomes, started_at, started))
}

/// Placement of every target, `None` for VMs that are not running.
async fn current_placements(
    ctx: &WorkloadContext,
    targets: Vec<Target>,
    concurrency: usize,
) -> IndexMap<Target, Option<Location>> {
    stream::iter(targets)
        .map(|target| {
            let controller = Arc::clone(&ctx.controller);
            async move {
                let location = match controller.placement(&target).await {
                    Ok(location) => location,
                    Err(e) => {
                        tracing::warn!(target = %target, error = %e, "Failed to read placement");
                        None
                    }
                };
                (target, location)
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

fn select_targets(
    placements: &IndexMap<Target, Option<Location>>,
    settings: &MigrationWorkloadSettings,
) -> Result<Vec<Target>> {
    let source = match &settings.mode {
        MigrationMode::Evacuate { source: Some(node) } => Some(node.clone()),
        MigrationMode::Evacuate { source: None } => Some(busiest_location(placements).ok_or_else(|| {
            Error::InvalidArgument("no running VMs to evacuate".into())
        })?),
        _ => settings.source_node.clone(),
    };

    let selected: Vec<Target> = placements
        .iter()
        .filter(|(_, location)| match &source {
            Some(node) => location.as_ref() == Some(node),
            None => true,
        })
        .map(|(target, _)| target.clone())
        .collect();

    if let (Some(node), true) = (&source, selected.is_empty()) {
        return Err(Error::InvalidArgument(format!("no VMs are running on node {}", node)));
    }
    Ok(selected)
}

/// Node running the most targets; ties go to the first name in order.
fn busiest_location(placements: &IndexMap<Target, Option<Location>>) -> Option<Location> {
    let mut counts: IndexMap<&Location, usize> = IndexMap::new();
    for location in placements.values().flatten() {
        *counts.entry(location).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_loc, a), (b_loc, b)| a.cmp(b).then_with(|| b_loc.as_str().cmp(a_loc.as_str())))
        .map(|(location, _)| location.clone())
}

fn measurement_outcome(target: Target, measurement: &MigrationMeasurement) -> Outcome {
    let mut outcome = Outcome::succeeded(target)
        .with_duration("observed", measurement.observed_duration_sec)
        .with_locations(
            Some(measurement.source.clone()),
            Some(measurement.destination.clone()),
        );
    if let Some(authoritative) = measurement.authoritative_duration_sec {
        outcome = outcome.with_duration("authoritative", authoritative);
    }
    if let Some(overhead) = measurement.overhead_sec() {
        outcome = outcome.with_duration("overhead", overhead);
    }
    if measurement.authoritative_start_inferred {
        outcome = outcome.with_inferred("authoritative");
    }
    if measurement.attempts > 1 {
        outcome.message = Some(format!("succeeded on attempt {}", measurement.attempts));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placements() -> IndexMap<Target, Option<Location>> {
        let mut map = IndexMap::new();
        map.insert(Target::vm("vm", "ns-1"), Some(Location::new("worker-b")));
        map.insert(Target::vm("vm", "ns-2"), Some(Location::new("worker-a")));
        map.insert(Target::vm("vm", "ns-3"), Some(Location::new("worker-b")));
        map.insert(Target::vm("vm", "ns-4"), None);
        map
    }

    fn settings(mode: MigrationMode) -> MigrationWorkloadSettings {
        MigrationWorkloadSettings::new(TargetRange::new("ns", 1, 4, "vm"), mode)
    }

    #[test]
    fn test_busiest_location() {
        assert_eq!(busiest_location(&placements()), Some(Location::new("worker-b")));
        assert_eq!(busiest_location(&IndexMap::new()), None);
    }

    #[test]
    fn test_select_evacuate() {
        let selected = select_targets(&placements(), &settings(MigrationMode::Evacuate { source: None })).unwrap();
        let scopes: Vec<&str> = selected.iter().map(|t| t.scope.as_str()).collect();
        assert_eq!(scopes, vec!["ns-1", "ns-3"]);

        let err = select_targets(
            &placements(),
            &settings(MigrationMode::Evacuate {
                source: Some(Location::new("worker-z")),
            }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_select_all_and_filtered() {
        let all = select_targets(&placements(), &settings(MigrationMode::Sequential)).unwrap();
        assert_eq!(all.len(), 4);

        let mut filtered = settings(MigrationMode::Parallel { interleave: false });
        filtered.source_node = Some(Location::new("worker-a"));
        let selected = select_targets(&placements(), &filtered).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].scope, "ns-2");
    }

    #[test]
    fn test_measurement_outcome() {
        let m = MigrationMeasurement {
            observed_duration_sec: 15.0,
            authoritative_duration_sec: Some(5.0),
            authoritative_start_inferred: true,
            source: Location::new("worker-a"),
            destination: Location::new("worker-b"),
            attempts: 2,
        };
        let outcome = measurement_outcome(Target::vm("vm", "ns-1"), &m);
        assert!(outcome.success);
        assert_eq!(outcome.durations["observed"], 15.0);
        assert_eq!(outcome.durations["authoritative"], 5.0);
        assert_eq!(outcome.durations["overhead"], 10.0);
        assert_eq!(outcome.inferred_metrics, vec!["authoritative"]);
        assert_eq!(outcome.dest_location, Some(Location::new("worker-b")));
    }
}

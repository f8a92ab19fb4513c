//! Capacity-probing workload.
//!
//! Each iteration creates a batch of VMs in one namespace, then resizes
//! their volumes, restarts them and snapshots them. Iterations repeat under
//! the [`CapacityProbe`] until the cluster stops scheduling new VMs, a phase
//! fails, the run is interrupted, or the iteration cap is hit. VMs from
//! earlier iterations stay in place so load accumulates.
//!
//! Metrics: `running`, `clone`, `resize`, `restart` and `snapshot`.

use chrono::Utc;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::creation::provision_vm;
use super::{
    healthy, merge_phase, outcome_from_poll, outcome_from_retry, phase_stops, phases, WorkloadContext,
    WorkloadReport,
};
use crate::aggregate::{FailureReason, Outcome, TerminalReason};
use crate::capacity::{CapacityProbe, IterationRecord, ProbeReport, ProbeSettings};
use crate::controller::ResourceSpec;
use crate::dispatcher::{never_stop, stop_on_exhaustion};
use crate::error::{Error, Result};
use crate::poller::{PollClassification, PollSettings, StatePoller};
use crate::target::{OperationKind, OperationRequest, ResourceKind, Target};
use crate::template::{VmTemplate, VmTemplateValues};

static SIZE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(GI|G)$").expect("Invalid size regex"));

/// Parse a size such as `30Gi` or `30G` into whole GiB.
pub fn parse_size_gi(size: &str) -> Result<u64> {
    let normalized = size.trim().to_uppercase();
    let captures = SIZE_REGEX
        .captures(&normalized)
        .ok_or_else(|| Error::InvalidArgument(format!("unsupported size format: {}", size)))?;
    captures[1]
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("size out of range: {}", size)))
}

/// `current + increment`, formatted as `{n}Gi`.
pub fn increment_size(current: &str, increment: &str) -> Result<String> {
    Ok(format!("{}Gi", parse_size_gi(current)? + parse_size_gi(increment)?))
}

/// How long a restarted VM gets to be seen leaving `Running`.
pub const DEFAULT_RESTART_LEAVE_TIMEOUT: Duration = Duration::from_secs(60);

const RUNNING: &str = "Running";

/// Request parameters.
pub const PARAM_MIN_SIZE: &str = "min_size";
pub const PARAM_INCREMENT: &str = "increment";
pub const PARAM_SIZE: &str = "size";
pub const PARAM_NAME: &str = "name";

/// Inputs of a capacity run.
#[derive(Debug, Clone)]
pub struct CapacitySettings {
    pub scope: String,
    /// VM names are `{vm_name}-{iteration}-{i}`
    pub vm_name: String,
    pub vms_per_iteration: u32,
    /// Used round-robin across iterations; the template default when empty
    pub storage_classes: Vec<String>,
    pub min_volume_size: String,
    pub volume_increment: String,
    pub concurrency: usize,
    pub template: VmTemplate,
    pub values: VmTemplateValues,
    pub probe: ProbeSettings,
    pub skip_scope_creation: bool,
    pub skip_resize: bool,
    pub skip_restart: bool,
    pub skip_snapshot: bool,
    pub restart_leave_timeout: Duration,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            scope: "virt-capacity-benchmark".into(),
            vm_name: "rhel-9-vm".into(),
            vms_per_iteration: 5,
            storage_classes: Vec::new(),
            min_volume_size: "30Gi".into(),
            volume_increment: "10Gi".into(),
            concurrency: 10,
            template: VmTemplate::builtin(),
            values: VmTemplateValues::default(),
            probe: ProbeSettings::default(),
            skip_scope_creation: false,
            skip_resize: false,
            skip_restart: false,
            skip_snapshot: false,
            restart_leave_timeout: DEFAULT_RESTART_LEAVE_TIMEOUT,
        }
    }
}

impl CapacitySettings {
    pub fn validate(&self) -> Result<()> {
        if self.vms_per_iteration == 0 {
            return Err(Error::InvalidArgument("--vms must be at least 1".into()));
        }
        parse_size_gi(&self.min_volume_size)?;
        parse_size_gi(&self.volume_increment)?;
        Ok(())
    }

    /// Storage class for a 1-indexed iteration.
    pub fn storage_class_for(&self, iteration: u32) -> &str {
        if self.storage_classes.is_empty() {
            return &self.values.storage_class;
        }
        let index = (iteration.saturating_sub(1) as usize) % self.storage_classes.len();
        &self.storage_classes[index]
    }

    pub fn iteration_targets(&self, iteration: u32) -> Vec<Target> {
        (1..=self.vms_per_iteration)
            .map(|i| Target::vm(format!("{}-{}-{}", self.vm_name, iteration, i), self.scope.clone()))
            .collect()
    }

    pub fn phases_skipped(&self) -> Vec<String> {
        [
            (self.skip_resize, "resize"),
            (self.skip_restart, "restart"),
            (self.skip_snapshot, "snapshot"),
        ]
        .into_iter()
        .filter(|(skipped, _)| *skipped)
        .map(|(_, phase)| phase.to_string())
        .collect()
    }
}

/// Probe-level record written as `iterations.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRecord {
    pub iterations_completed: usize,
    pub total_vms: usize,
    pub total_volumes: usize,
    pub capacity_reached: bool,
    pub end_reason: TerminalReason,
    pub phases_skipped: Vec<String>,
    pub iterations: Vec<IterationRecord>,
}

/// Result of a capacity run.
#[derive(Debug, Clone)]
pub struct CapacityReport {
    pub probe: ProbeReport,
    pub workload: WorkloadReport,
    /// VMs that reached `Running`
    pub total_vms: usize,
    pub total_volumes: usize,
    pub phases_skipped: Vec<String>,
}

impl CapacityReport {
    pub fn record(&self) -> CapacityRecord {
        CapacityRecord {
            iterations_completed: self.probe.iterations_completed(),
            total_vms: self.total_vms,
            total_volumes: self.total_volumes,
            capacity_reached: self.probe.capacity_reached(),
            end_reason: self.probe.end_reason,
            phases_skipped: self.phases_skipped.clone(),
            iterations: self.probe.iterations.clone(),
        }
    }
}

/// Run the capacity workload.
pub async fn run(ctx: &WorkloadContext, settings: &CapacitySettings) -> Result<CapacityReport> {
    settings.validate()?;
    let started_at = Utc::now();
    let started = Instant::now();

    if !settings.skip_scope_creation {
        let request = ctx.request(Target::scope(settings.scope.clone()), OperationKind::Create);
        ctx.submit(&request, || ctx.controller.ensure_scope(&settings.scope))
            .await
            .map_err(|e| e.into_error(&request.label()))?;
    }

    let collected: Arc<Mutex<Vec<Outcome>>> = Arc::default();
    let volumes = Arc::new(AtomicUsize::new(0));
    let probe = CapacityProbe::new(settings.probe, ctx.observer.clone(), ctx.cancel.clone());

    let report = probe
        .run(|iteration| {
            let collected = Arc::clone(&collected);
            let volumes = Arc::clone(&volumes);
            async move {
                let outcomes = run_iteration(ctx, settings, iteration, volumes).await;
                collected.lock().extend(outcomes.iter().cloned());
                outcomes
            }
        })
        .await;

    let outcomes = std::mem::take(&mut *collected.lock());
    let total_vms = outcomes
        .iter()
        .filter(|o| o.durations.contains_key("running"))
        .count();
    tracing::info!(
        iterations = report.iterations.len(),
        total_vms,
        end_reason = report.end_reason.as_str(),
        "Capacity probe finished"
    );

    let workload = WorkloadReport::with_summary(
        "capacity",
        outcomes,
        report.cumulative.clone(),
        started_at,
        started,
    );
    Ok(CapacityReport {
        probe: report,
        workload,
        total_vms,
        total_volumes: volumes.load(Ordering::Relaxed),
        phases_skipped: settings.phases_skipped(),
    })
}

/// One iteration: create, then each enabled phase over the VMs still healthy.
/// A phase that ends with a stop condition skips the phases after it.
async fn run_iteration(
    ctx: &WorkloadContext,
    settings: &CapacitySettings,
    iteration: u32,
    volumes: Arc<AtomicUsize>,
) -> Vec<Outcome> {
    let storage_class = settings.storage_class_for(iteration).to_string();
    tracing::info!(
        iteration,
        storage_class = %storage_class,
        vms = settings.vms_per_iteration,
        "Starting capacity iteration"
    );

    let created = create_phase(ctx, settings, iteration, storage_class).await;
    let mut stopped = phase_stops(&created);
    let mut results: IndexMap<Target, Outcome> =
        created.into_iter().map(|o| (o.target.clone(), o)).collect();

    if settings.skip_resize {
        count_volumes(ctx, &healthy(&results), &volumes).await;
    } else if !stopped {
        let requests = healthy(&results)
            .into_iter()
            .map(|target| {
                ctx.request(target, OperationKind::Resize)
                    .with_parameter(PARAM_MIN_SIZE, settings.min_volume_size.clone())
                    .with_parameter(PARAM_INCREMENT, settings.volume_increment.clone())
            })
            .collect();
        let work = move |ctx: WorkloadContext, request: OperationRequest| {
            let volumes = Arc::clone(&volumes);
            async move { resize_volumes(&ctx, request, &volumes).await }
        };
        let outcomes = run_phase(ctx, settings.concurrency, "resize", requests, work).await;
        stopped = merge_phase(&mut results, outcomes);
    }

    if !settings.skip_restart && !stopped {
        let leave_timeout = settings.restart_leave_timeout;
        let requests = healthy(&results)
            .into_iter()
            .map(|target| ctx.request(target, OperationKind::Restart))
            .collect();
        let work = move |ctx: WorkloadContext, request: OperationRequest| async move {
            restart_vm(&ctx, request, leave_timeout).await
        };
        let outcomes = run_phase(ctx, settings.concurrency, "restart", requests, work).await;
        stopped = merge_phase(&mut results, outcomes);
    }

    if !settings.skip_snapshot && !stopped {
        let requests = healthy(&results)
            .into_iter()
            .map(|target| {
                let name = format!("{}-snapshot", target.id);
                ctx.request(target, OperationKind::Snapshot).with_parameter(PARAM_NAME, name)
            })
            .collect();
        let work = |ctx: WorkloadContext, request: OperationRequest| async move { snapshot_vm(&ctx, request).await };
        let outcomes = run_phase(ctx, settings.concurrency, "snapshot", requests, work).await;
        merge_phase(&mut results, outcomes);
    }

    results.into_values().collect()
}

async fn create_phase(
    ctx: &WorkloadContext,
    settings: &CapacitySettings,
    iteration: u32,
    storage_class: String,
) -> Vec<Outcome> {
    let template = Arc::new(settings.template.clone());
    let values = VmTemplateValues {
        storage_class,
        storage_size: settings.min_volume_size.clone(),
        ..settings.values.clone()
    };
    let requests: Vec<OperationRequest> = settings
        .iteration_targets(iteration)
        .into_iter()
        .map(|target| ctx.request(target, OperationKind::Create))
        .collect();
    let work_ctx = ctx.clone();
    let work = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        let template = Arc::clone(&template);
        let values = values.for_vm(request.target().id.clone());
        async move {
            match template.render(&values) {
                Ok(manifest) => provision_vm(&ctx, &request, &ResourceSpec::new(manifest), true).await,
                Err(e) => Outcome::failed(request.target().clone(), FailureReason::Error, e.to_string()),
            }
        }
    };
    ctx.dispatcher(settings.concurrency)
        .run_all(requests, work, stop_on_exhaustion)
        .await
}

async fn run_phase<F, Fut>(
    ctx: &WorkloadContext,
    concurrency: usize,
    phase: &str,
    requests: Vec<OperationRequest>,
    work: F,
) -> Vec<Outcome>
where
    F: Fn(WorkloadContext, OperationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    tracing::info!(phase, vms = requests.len(), "Starting phase");
    let work_ctx = ctx.clone();
    ctx.dispatcher(concurrency)
        .run_all(requests, move |request| work(work_ctx.clone(), request), never_stop)
        .await
}

async fn count_volumes(ctx: &WorkloadContext, targets: &[Target], counter: &AtomicUsize) {
    for target in targets {
        match ctx.controller.volumes(target).await {
            Ok(found) => {
                counter.fetch_add(found.len(), Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(target = %target, error = %e, "Failed to list volumes"),
        }
    }
}

fn required<'a>(request: &'a OperationRequest, key: &str) -> std::result::Result<&'a str, Outcome> {
    request.parameter(key).ok_or_else(|| {
        let message = format!("{} request is missing parameter '{}'", request.kind(), key);
        Outcome::failed(request.target().clone(), FailureReason::Error, message)
    })
}

/// Grow every volume of a VM by the request's `increment` and wait for each
/// expansion.
async fn resize_volumes(ctx: &WorkloadContext, request: OperationRequest, counter: &AtomicUsize) -> Outcome {
    let (min_size, increment) = match (required(&request, PARAM_MIN_SIZE), required(&request, PARAM_INCREMENT)) {
        (Ok(min_size), Ok(increment)) => (min_size, increment),
        (Err(outcome), _) | (_, Err(outcome)) => return outcome,
    };
    let target = request.target().clone();
    let started = Instant::now();
    let volumes = match ctx.controller.volumes(&target).await {
        Ok(volumes) => volumes,
        Err(e) => {
            return Outcome::failed(target, FailureReason::Error, format!("list volumes: {}", e))
        }
    };
    counter.fetch_add(volumes.len(), Ordering::Relaxed);

    for volume in &volumes {
        let current = match ctx.controller.volume_size(volume).await {
            Ok(Some(size)) => size,
            Ok(None) => min_size.to_string(),
            Err(e) => {
                let message = format!("read size of {}: {}", volume.id, e);
                return Outcome::failed(target, FailureReason::Error, message);
            }
        };
        let new_size = match increment_size(&current, increment) {
            Ok(size) => size,
            Err(e) => return Outcome::failed(target, FailureReason::Error, e.to_string()),
        };
        tracing::info!(volume = %volume, from = %current, to = %new_size, "Resizing volume");

        let resize = OperationRequest::new(volume.clone(), OperationKind::Resize, request.retry_policy().clone())
            .with_parameter(PARAM_SIZE, new_size.clone());
        if let Err(e) = ctx.submit(&resize, || ctx.controller.resize(volume, &new_size)).await {
            return outcome_from_retry(target, &e);
        }

        let result = ctx
            .poller(phases::volume_resized())
            .with_retry_policy(request.retry_policy().clone())
            .await_phase(volume, || ctx.controller.status(volume))
            .await;
        if !result.is_success() {
            return outcome_from_poll(target, &result, "resize");
        }
    }

    Outcome::succeeded(target).with_duration("resize", started.elapsed().as_secs_f64())
}

/// Restart a VM and time it back to `Running`. The VM is first given a
/// short window to be seen leaving `Running`, so the old instance is not
/// mistaken for the new one.
///
/// When the VM never appears to leave `Running` the replacement happened
/// between two samples. The duration then runs from the restart call to
/// the first `Running` sample after it and is flagged inferred.
async fn restart_vm(ctx: &WorkloadContext, request: OperationRequest, leave_timeout: Duration) -> Outcome {
    let target = request.target().clone();
    let started = Instant::now();
    if let Err(e) = ctx.submit(&request, || ctx.controller.restart(&target)).await {
        return outcome_from_retry(target, &e);
    }

    let leave = PollSettings {
        global_timeout: leave_timeout,
        ..ctx.poll
    };
    let mut first_running: Option<Instant> = None;
    let left = StatePoller::new(phases::vm_left_running(), leave, ctx.observer.clone(), ctx.cancel.clone())
        .with_retry_policy(request.retry_policy().clone())
        .await_observed(
            &target,
            started,
            || ctx.controller.status(&target),
            |phase, at| {
                if first_running.is_none() && phase.is(RUNNING) {
                    first_running = Some(at);
                }
            },
        )
        .await;
    match left.classification {
        PollClassification::Success => {}
        PollClassification::Timeout => {
            if let (Some(at), Some(last)) = (first_running, &left.final_phase) {
                if last.is(RUNNING) {
                    tracing::warn!(target = %target, "VM not seen leaving Running; restart time is inferred");
                    let duration = at.saturating_duration_since(started).as_secs_f64();
                    return Outcome::succeeded(target)
                        .with_duration("restart", duration)
                        .with_inferred("restart");
                }
            }
            tracing::debug!(target = %target, "VM not seen leaving Running; waiting for Running anyway");
        }
        _ => return outcome_from_poll(target, &left, "restart"),
    }

    let result = ctx
        .poller(phases::vm_ready())
        .with_retry_policy(request.retry_policy().clone())
        .await_phase_since(&target, started, || ctx.controller.status(&target))
        .await;
    outcome_from_poll(target, &result, "restart")
}

/// Snapshot a VM under the request's `name` and wait for it to be ready.
async fn snapshot_vm(ctx: &WorkloadContext, request: OperationRequest) -> Outcome {
    let name = match required(&request, PARAM_NAME) {
        Ok(name) => name.to_string(),
        Err(outcome) => return outcome,
    };
    let target = request.target().clone();
    let started = Instant::now();
    let snapshot = target.related(name, ResourceKind::Snapshot);
    if let Err(e) = ctx.submit(&request, || ctx.controller.snapshot(&target, &snapshot.id)).await {
        return outcome_from_retry(target, &e);
    }

    let result = ctx
        .poller(phases::snapshot_ready())
        .with_retry_policy(request.retry_policy().clone())
        .await_phase_since(&snapshot, started, || ctx.controller.status(&snapshot))
        .await;
    outcome_from_poll(target, &result, "snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size_gi("30Gi").unwrap(), 30);
        assert_eq!(parse_size_gi(" 40gi ").unwrap(), 40);
        assert_eq!(parse_size_gi("25G").unwrap(), 25);
        assert!(parse_size_gi("30Mi").is_err());
        assert!(parse_size_gi("Gi").is_err());
    }

    #[test]
    fn test_increment_size() {
        assert_eq!(increment_size("30Gi", "10Gi").unwrap(), "40Gi");
        assert_eq!(increment_size("30G", "5gi").unwrap(), "35Gi");
        assert!(increment_size("1Ti", "10Gi").is_err());
    }

    #[test]
    fn test_storage_class_round_robin() {
        let mut settings = CapacitySettings::default();
        assert_eq!(settings.storage_class_for(3), "standard");

        settings.storage_classes = vec!["fast".into(), "slow".into()];
        assert_eq!(settings.storage_class_for(1), "fast");
        assert_eq!(settings.storage_class_for(2), "slow");
        assert_eq!(settings.storage_class_for(3), "fast");
    }

    #[test]
    fn test_iteration_targets() {
        let settings = CapacitySettings {
            vms_per_iteration: 2,
            ..Default::default()
        };
        let targets = settings.iteration_targets(4);
        assert_eq!(targets[0].id, "rhel-9-vm-4-1");
        assert_eq!(targets[1].id, "rhel-9-vm-4-2");
        assert!(targets.iter().all(|t| t.scope == "virt-capacity-benchmark"));
    }

    #[test]
    fn test_phases_skipped_and_validate() {
        let settings = CapacitySettings {
            skip_resize: true,
            skip_snapshot: true,
            ..Default::default()
        };
        assert_eq!(settings.phases_skipped(), vec!["resize", "snapshot"]);
        assert!(settings.validate().is_ok());

        let bad = CapacitySettings {
            volume_increment: "ten".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}

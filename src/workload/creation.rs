//! VM creation workload.
//!
//! One namespace per target (`{prefix}-{i}`), each holding one VM with the
//! same name. Namespaces are created first in their own bounded batch; VMs
//! are then created through the retry engine and polled to `Running`. The
//! clone of the VM's root volume is tracked alongside when requested.
//!
//! With `boot_storm` set, every VM that came up is then stopped and all of
//! them are started together, measuring each back to `Running`.
//!
//! Metrics: `running` (create call to `Running`) and `clone`; `stop` and
//! `boot` for boot storms.

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

use super::{
    healthy, merge_phase, outcome_from_poll, outcome_from_retry, phases, WorkloadContext, WorkloadReport,
};
use crate::aggregate::{FailureReason, Outcome};
use crate::controller::{Location, ResourceSpec};
use crate::dispatcher::{never_stop, stop_on_exhaustion};
use crate::error::{Error, Result};
use crate::target::{OperationKind, OperationRequest, ResourceKind, Target, TargetRange};
use crate::template::{VmTemplate, VmTemplateValues};

/// Namespaces created in parallel.
pub const DEFAULT_SCOPE_CONCURRENCY: usize = 20;

/// Inputs of a creation run.
#[derive(Debug, Clone)]
pub struct CreationSettings {
    pub range: TargetRange,
    pub concurrency: usize,
    pub scope_concurrency: usize,
    pub template: VmTemplate,
    pub values: VmTemplateValues,
    /// Reuse existing namespaces
    pub skip_scope_creation: bool,
    /// Pin every VM to one node
    pub single_node: bool,
    /// Node to pin to; the first worker when unset
    pub node_name: Option<String>,
    pub track_clone: bool,
    pub stop_on_exhaustion: bool,
    /// Stop the created VMs, then start them all at once
    pub boot_storm: bool,
}

impl CreationSettings {
    pub fn new(range: TargetRange) -> Self {
        let values = VmTemplateValues::default().for_vm(range.name.clone());
        Self {
            range,
            concurrency: 50,
            scope_concurrency: DEFAULT_SCOPE_CONCURRENCY,
            template: VmTemplate::builtin(),
            values,
            skip_scope_creation: false,
            single_node: false,
            node_name: None,
            track_clone: true,
            stop_on_exhaustion: false,
            boot_storm: false,
        }
    }
}

/// Run the creation workload.
pub async fn run(ctx: &WorkloadContext, settings: &CreationSettings) -> Result<WorkloadReport> {
    let started_at = Utc::now();
    let started = Instant::now();

    let node = resolve_node(ctx, settings).await?;
    let values = settings.values.for_vm(settings.range.name.clone());
    let manifest = settings
        .template
        .render_on_node(&values, node.as_ref().map(Location::as_str))?;
    let spec = Arc::new(ResourceSpec::new(manifest));

    let mut outcomes = Vec::with_capacity(settings.range.len());
    let mut targets = settings.range.targets();

    if !settings.skip_scope_creation {
        let scope_outcomes = ensure_scopes(ctx, settings.range.scopes(), settings.scope_concurrency).await;
        let (ready, failed) = partition_by_scope(targets, &scope_outcomes);
        outcomes.extend(failed);
        targets = ready;
    }

    tracing::info!(
        targets = targets.len(),
        concurrency = settings.concurrency,
        "Creating VMs"
    );

    let work_ctx = ctx.clone();
    let track_clone = settings.track_clone;
    let work = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        let spec = Arc::clone(&spec);
        async move { provision_vm(&ctx, &request, &spec, track_clone).await }
    };
    let stop: fn(&Outcome) -> bool = if settings.stop_on_exhaustion {
        stop_on_exhaustion
    } else {
        never_stop
    };
    let requests = targets
        .into_iter()
        .map(|target| ctx.request(target, OperationKind::Create))
        .collect();
    outcomes.extend(ctx.dispatcher(settings.concurrency).run_all(requests, work, stop).await);

    if settings.boot_storm && !ctx.cancel.is_cancelled() {
        outcomes = boot_storm(ctx, outcomes, settings.concurrency).await;
    }

    Ok(WorkloadReport::new("creation", outcomes, started_at, started))
}

async fn resolve_node(ctx: &WorkloadContext, settings: &CreationSettings) -> Result<Option<Location>> {
    if !settings.single_node {
        return Ok(settings.node_name.clone().map(Location::new));
    }
    if let Some(name) = &settings.node_name {
        return Ok(Some(Location::new(name.clone())));
    }
    let locations = ctx.controller.locations().await?;
    let node = locations
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidArgument("no worker nodes available for --single-node".into()))?;
    tracing::info!(node = %node, "Pinning all VMs to one node");
    Ok(Some(node))
}

/// Create namespaces in a bounded batch. One outcome per scope.
pub async fn ensure_scopes(ctx: &WorkloadContext, scopes: Vec<String>, concurrency: usize) -> Vec<Outcome> {
    let work_ctx = ctx.clone();
    let work = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        async move {
            let scope = request.target().clone();
            match ctx.submit(&request, || ctx.controller.ensure_scope(&scope.scope)).await {
                Ok(()) => Outcome::succeeded(scope),
                Err(e) => outcome_from_retry(scope, &e),
            }
        }
    };
    let requests = scopes
        .into_iter()
        .map(|scope| ctx.request(Target::scope(scope), OperationKind::Create))
        .collect();
    ctx.dispatcher(concurrency).run_all(requests, work, never_stop).await
}

/// Split targets into those whose scope exists and failed outcomes for the
/// rest.
fn partition_by_scope(targets: Vec<Target>, scope_outcomes: &[Outcome]) -> (Vec<Target>, Vec<Outcome>) {
    let failed: HashMap<&str, &Outcome> = scope_outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| (o.target.scope.as_str(), o))
        .collect();

    let mut ready = Vec::with_capacity(targets.len());
    let mut outcomes = Vec::new();
    for target in targets {
        match failed.get(target.scope.as_str()) {
            None => ready.push(target),
            Some(scope) => {
                let reason = scope.failure_reason.unwrap_or(FailureReason::Error);
                let outcome = match &scope.message {
                    Some(message) => Outcome::failed(target, reason, format!("namespace: {}", message)),
                    None => Outcome::not_dispatched(target, reason),
                };
                outcomes.push(outcome);
            }
        }
    }
    (ready, outcomes)
}

/// Create one VM and wait for it to run.
pub async fn provision_vm(
    ctx: &WorkloadContext,
    request: &OperationRequest,
    spec: &ResourceSpec,
    track_clone: bool,
) -> Outcome {
    let target = request.target();
    let created_at = Instant::now();
    if let Err(e) = ctx.submit(request, || ctx.controller.create(target, spec)).await {
        return outcome_from_retry(target.clone(), &e);
    }

    let span = track_clone.then(|| Arc::new(Mutex::new(phases::clone_span(ctx.poll.poll_interval))));
    let volume = target.related(format!("{}-volume", target.id), ResourceKind::DataVolume);
    let clone_failed = phases::clone_failed();

    let oracle = || {
        let controller = Arc::clone(&ctx.controller);
        let span = span.clone();
        let volume = volume.clone();
        let clone_failed = clone_failed.clone();
        async move {
            if let Some(span) = span {
                let pending = span.lock().duration().is_none();
                if pending {
                    match controller.status(&volume).await {
                        Ok(phase) if clone_failed.contains(&phase) => {
                            tracing::warn!(volume = %volume, "Clone reported Failed");
                        }
                        Ok(phase) => {
                            let now = Instant::now();
                            span.lock().observe(&phase, now);
                        }
                        Err(e) => tracing::debug!(volume = %volume, error = %e, "Clone status unavailable"),
                    }
                }
            }
            controller.status(target).await
        }
    };

    let result = ctx
        .poller(phases::vm_ready())
        .with_retry_policy(request.retry_policy().clone())
        .await_phase_since(target, created_at, oracle)
        .await;

    let mut outcome = outcome_from_poll(target.clone(), &result, "running");
    if outcome.success {
        if let Some(span) = &span {
            let span = span.lock();
            if let Some(duration) = span.duration() {
                outcome = outcome.with_duration("clone", duration);
                if span.is_inferred() {
                    outcome = outcome.with_inferred("clone");
                }
            }
        }
    }
    outcome
}

/// Stop every VM that came up, then start them all together and time each
/// back to `Running`. VMs that fail to stop are not started.
pub async fn boot_storm(ctx: &WorkloadContext, outcomes: Vec<Outcome>, concurrency: usize) -> Vec<Outcome> {
    let mut results: IndexMap<Target, Outcome> =
        outcomes.into_iter().map(|o| (o.target.clone(), o)).collect();

    let running = healthy(&results);
    tracing::info!(vms = running.len(), "Stopping VMs for boot storm");
    let requests = running
        .into_iter()
        .map(|target| ctx.request(target, OperationKind::Stop))
        .collect();
    let work_ctx = ctx.clone();
    let stop = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        async move { stop_vm(&ctx, &request).await }
    };
    let stopped = ctx.dispatcher(concurrency).run_all(requests, stop, never_stop).await;
    merge_phase(&mut results, stopped);

    if ctx.cancel.is_cancelled() {
        return results.into_values().collect();
    }

    let halted = healthy(&results);
    tracing::info!(vms = halted.len(), "Starting boot storm");
    let requests = halted
        .into_iter()
        .map(|target| ctx.request(target, OperationKind::Start))
        .collect();
    let work_ctx = ctx.clone();
    let start = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        async move { boot_vm(&ctx, &request).await }
    };
    // Every halted VM is started at once.
    let booted = ctx
        .dispatcher(concurrency.max(results.len()))
        .run_all(requests, start, never_stop)
        .await;
    merge_phase(&mut results, booted);

    results.into_values().collect()
}

async fn stop_vm(ctx: &WorkloadContext, request: &OperationRequest) -> Outcome {
    let target = request.target();
    let started = Instant::now();
    if let Err(e) = ctx.submit(request, || ctx.controller.stop(target)).await {
        return outcome_from_retry(target.clone(), &e);
    }
    let result = ctx
        .poller(phases::vm_stopped())
        .with_retry_policy(request.retry_policy().clone())
        .await_phase_since(target, started, || ctx.controller.status(target))
        .await;
    outcome_from_poll(target.clone(), &result, "stop")
}

/// Measured from the accepted start call, so retries of the call itself are
/// not counted.
async fn boot_vm(ctx: &WorkloadContext, request: &OperationRequest) -> Outcome {
    let target = request.target();
    if let Err(e) = ctx.submit(request, || ctx.controller.start(target)).await {
        return outcome_from_retry(target.clone(), &e);
    }
    let started = Instant::now();
    let result = ctx
        .poller(phases::vm_ready())
        .with_retry_policy(request.retry_policy().clone())
        .await_phase_since(target, started, || ctx.controller.status(target))
        .await;
    outcome_from_poll(target.clone(), &result, "boot")
}

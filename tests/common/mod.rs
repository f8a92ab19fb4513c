//! Shared test utilities for the virtbench integration tests.
//!
//! This module provides:
//! - A scripted [`MockController`] standing in for the cluster
//! - A [`RecordingObserver`] that keeps every engine event
//! - Outcome builders for aggregation tests
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use virtbench::aggregate::{FailureReason, Outcome, RunSummary};
use virtbench::controller::{
    Location, MigrationHandle, MigrationTimestamps, Phase, ResourceController, ResourceSpec,
};
use virtbench::error::{Error, Result};
use virtbench::poller::{PollResult, PollSettings};
use virtbench::retry::RetryPolicy;
use virtbench::target::{ResourceKind, Target};
use virtbench::telemetry::{BenchmarkObserver, RetryEvent, SharedObserver};
use virtbench::workload::WorkloadContext;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted responses
// ============================================================================

/// One scripted response of the phase oracle.
#[derive(Debug, Clone)]
pub enum Step {
    Phase(Phase),
    /// Error whose message matches the retryable vocabulary
    Transient(String),
    /// Error that is never retried
    Fatal(String),
}

impl Step {
    pub fn phase(name: &str) -> Self {
        Step::Phase(Phase::named(name))
    }

    pub fn absent() -> Self {
        Step::Phase(Phase::Absent)
    }

    pub fn transient() -> Self {
        Step::Transient("dial tcp 10.0.0.1:6443: connection refused".into())
    }

    pub fn fatal() -> Self {
        Step::Fatal("forbidden: user cannot get resource".into())
    }

    fn resolve(&self, operation: &str, target: &Target) -> Result<Phase> {
        match self {
            Step::Phase(phase) => Ok(phase.clone()),
            Step::Transient(message) | Step::Fatal(message) => {
                Err(Error::control_plane(operation, target.to_string(), message.clone()))
            }
        }
    }
}

/// Phases by name, for brevity in scripts.
pub fn steps(names: &[&str]) -> Vec<Step> {
    names.iter().map(|name| Step::phase(name)).collect()
}

/// Responses consumed in order; the last one repeats forever.
#[derive(Debug, Clone)]
struct Script<T> {
    steps: VecDeque<T>,
}

impl<T: Clone> Script<T> {
    fn new(steps: impl IntoIterator<Item = T>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    fn next(&mut self) -> Option<T> {
        if self.steps.len() > 1 {
            self.steps.pop_front()
        } else {
            self.steps.front().cloned()
        }
    }
}

/// A control-plane call the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureScope(String),
    Create(Target),
    Resize(Target, String),
    Restart(Target),
    Snapshot(Target, String),
    Migrate(Target),
    Stop(Target),
    Start(Target),
    Uncordon(Location),
    Delete(Target),
}

#[derive(Default)]
struct MockState {
    statuses: HashMap<Target, Script<Step>>,
    default_status: Option<Step>,
    placements: HashMap<Target, Script<Option<Location>>>,
    failures: HashMap<(&'static str, Target), VecDeque<String>>,
    timestamps: HashMap<Target, Script<MigrationTimestamps>>,
    locations: Vec<Location>,
    volumes: HashMap<Target, Vec<Target>>,
    volume_sizes: HashMap<Target, String>,
    calls: Vec<Call>,
    migrations: u32,
}

// ============================================================================
// Mock controller
// ============================================================================

/// Controller whose every answer is scripted up front.
///
/// Unscripted status reads return the default status (`Running` unless
/// changed); unscripted placements return `None`.
pub struct MockController {
    state: Mutex<MockState>,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    pub fn new() -> Self {
        let state = MockState {
            default_status: Some(Step::phase("Running")),
            ..MockState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Status reads of `target` follow `steps`.
    pub fn with_status(self, target: &Target, steps: Vec<Step>) -> Self {
        self.state.lock().statuses.insert(target.clone(), Script::new(steps));
        self
    }

    pub fn with_default_status(self, step: Step) -> Self {
        self.state.lock().default_status = Some(step);
        self
    }

    /// Placement reads of `target` follow `nodes`.
    pub fn with_placements(self, target: &Target, nodes: &[Option<&str>]) -> Self {
        let script = Script::new(nodes.iter().map(|n| n.map(Location::new)));
        self.state.lock().placements.insert(target.clone(), script);
        self
    }

    /// `operation` on `target` fails with each message in turn, then succeeds.
    pub fn failing(self, operation: &'static str, target: &Target, messages: &[&str]) -> Self {
        let queue = messages.iter().map(|m| m.to_string()).collect();
        self.state.lock().failures.insert((operation, target.clone()), queue);
        self
    }

    /// Timestamps reported for migrations of `target`.
    pub fn with_timestamps(self, target: &Target, timestamps: Vec<MigrationTimestamps>) -> Self {
        self.state.lock().timestamps.insert(target.clone(), Script::new(timestamps));
        self
    }

    pub fn with_locations(self, nodes: &[&str]) -> Self {
        self.state.lock().locations = nodes.iter().map(|n| Location::new(*n)).collect();
        self
    }

    pub fn with_volumes(self, target: &Target, volumes: Vec<(Target, &str)>) -> Self {
        let mut state = self.state.lock();
        for (volume, size) in &volumes {
            state.volume_sizes.insert(volume.clone(), size.to_string());
        }
        state
            .volumes
            .insert(target.clone(), volumes.into_iter().map(|(v, _)| v).collect());
        drop(state);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn migrations(&self) -> u32 {
        self.state.lock().migrations
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn scripted_failure(&self, operation: &'static str, target: &Target) -> Result<()> {
        let mut state = self.state.lock();
        let next = state
            .failures
            .get_mut(&(operation, target.clone()))
            .and_then(VecDeque::pop_front);
        match next {
            Some(message) => Err(Error::control_plane(operation, target.to_string(), message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceController for MockController {
    async fn ensure_scope(&self, scope: &str) -> Result<()> {
        self.record(Call::EnsureScope(scope.to_string()));
        self.scripted_failure("ensure_scope", &Target::scope(scope))
    }

    async fn create(&self, target: &Target, _spec: &ResourceSpec) -> Result<()> {
        self.record(Call::Create(target.clone()));
        self.scripted_failure("create", target)
    }

    async fn status(&self, target: &Target) -> Result<Phase> {
        let step = {
            let mut state = self.state.lock();
            match state.statuses.get_mut(target) {
                Some(script) => script.next(),
                None => state.default_status.clone(),
            }
        };
        match step {
            Some(step) => step.resolve("status", target),
            None => Ok(Phase::Absent),
        }
    }

    async fn placement(&self, target: &Target) -> Result<Option<Location>> {
        let mut state = self.state.lock();
        Ok(state
            .placements
            .get_mut(target)
            .and_then(Script::next)
            .flatten())
    }

    async fn resize(&self, target: &Target, new_size: &str) -> Result<()> {
        self.record(Call::Resize(target.clone(), new_size.to_string()));
        self.scripted_failure("resize", target)?;
        self.state
            .lock()
            .volume_sizes
            .insert(target.clone(), new_size.to_string());
        Ok(())
    }

    async fn restart(&self, target: &Target) -> Result<()> {
        self.record(Call::Restart(target.clone()));
        self.scripted_failure("restart", target)
    }

    async fn snapshot(&self, target: &Target, name: &str) -> Result<()> {
        self.record(Call::Snapshot(target.clone(), name.to_string()));
        self.scripted_failure("snapshot", target)
    }

    async fn migrate(&self, target: &Target, _dest_hint: Option<&Location>) -> Result<MigrationHandle> {
        self.record(Call::Migrate(target.clone()));
        self.scripted_failure("migrate", target)?;
        let mut state = self.state.lock();
        state.migrations += 1;
        Ok(MigrationHandle {
            name: format!("{}-migration-{}", target.id, state.migrations),
            target: target.clone(),
        })
    }

    async fn migration_timestamps(&self, handle: &MigrationHandle) -> Result<MigrationTimestamps> {
        self.scripted_failure("timestamps", &handle.target)?;
        let mut state = self.state.lock();
        Ok(state
            .timestamps
            .get_mut(&handle.target)
            .and_then(Script::next)
            .unwrap_or_else(|| MigrationTimestamps {
                phase: Phase::named("Running"),
                ..MigrationTimestamps::absent()
            }))
    }

    async fn stop(&self, target: &Target) -> Result<()> {
        self.record(Call::Stop(target.clone()));
        self.scripted_failure("stop", target)
    }

    async fn start(&self, target: &Target) -> Result<()> {
        self.record(Call::Start(target.clone()));
        self.scripted_failure("start", target)
    }

    async fn uncordon(&self, location: &Location) -> Result<()> {
        self.record(Call::Uncordon(location.clone()));
        Ok(())
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        self.record(Call::Delete(target.clone()));
        self.scripted_failure("delete", target)
    }

    async fn locations(&self) -> Result<Vec<Location>> {
        let locations = self.state.lock().locations.clone();
        if locations.is_empty() {
            return Err(Error::Unsupported("locations".into()));
        }
        Ok(locations)
    }

    async fn volumes(&self, target: &Target) -> Result<Vec<Target>> {
        Ok(self.state.lock().volumes.get(target).cloned().unwrap_or_default())
    }

    async fn volume_size(&self, target: &Target) -> Result<Option<String>> {
        Ok(self.state.lock().volume_sizes.get(target).cloned())
    }
}

// ============================================================================
// Recording observer
// ============================================================================

/// Every event the engine emitted, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Retry { operation: String, attempt: u32 },
    Fatal { operation: String, attempts: u32 },
    PhaseChange { target: Target, to: Phase },
    PollError { target: Target, fatal: bool },
    PollFinished { target: Target, result: PollResult },
    Dispatch(Target),
    Outcome(Outcome),
    Skipped(Target, FailureReason),
    MigrationAttempt { target: Target, attempt: u32 },
    IterationFinished { iteration: u32, summary: RunSummary },
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn dispatched(&self) -> Vec<Target> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Dispatch(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn retries(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Retry { .. }))
            .count()
    }

    pub fn iterations(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::IterationFinished { iteration, .. } => Some(*iteration),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl BenchmarkObserver for RecordingObserver {
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self.push(Event::Retry {
            operation: event.operation.to_string(),
            attempt: event.attempt,
        });
    }

    fn on_fatal(&self, operation: &str, attempts: u32, _error: &str) {
        self.push(Event::Fatal {
            operation: operation.to_string(),
            attempts,
        });
    }

    fn on_phase_change(&self, target: &Target, _from: Option<&Phase>, to: &Phase, _elapsed: std::time::Duration) {
        self.push(Event::PhaseChange {
            target: target.clone(),
            to: to.clone(),
        });
    }

    fn on_poll_error(&self, target: &Target, _error: &str, fatal: bool) {
        self.push(Event::PollError {
            target: target.clone(),
            fatal,
        });
    }

    fn on_poll_finished(&self, target: &Target, result: &PollResult) {
        self.push(Event::PollFinished {
            target: target.clone(),
            result: result.clone(),
        });
    }

    fn on_dispatch(&self, target: &Target) {
        self.push(Event::Dispatch(target.clone()));
    }

    fn on_outcome(&self, outcome: &Outcome) {
        self.push(Event::Outcome(outcome.clone()));
    }

    fn on_skipped(&self, target: &Target, reason: FailureReason) {
        self.push(Event::Skipped(target.clone(), reason));
    }

    fn on_migration_attempt(&self, target: &Target, attempt: u32, _source: &Location) {
        self.push(Event::MigrationAttempt {
            target: target.clone(),
            attempt,
        });
    }

    fn on_iteration_finished(&self, iteration: u32, summary: &RunSummary) {
        self.push(Event::IterationFinished {
            iteration,
            summary: summary.clone(),
        });
    }
}

// ============================================================================
// Context builders
// ============================================================================

/// Poll settings used across the suite: 5s interval, 120s exhaustion, 30m cap.
pub fn poll_settings() -> PollSettings {
    PollSettings::default()
}

/// Fast retry policy: 3 attempts, 1s initial delay.
pub fn retry_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .initial_delay(std::time::Duration::from_secs(1))
        .backoff_multiplier(2.0)
        .build()
}

/// Workload context over `controller`, reporting to `observer`.
pub fn context(
    controller: Arc<MockController>,
    observer: Arc<RecordingObserver>,
    cancel: CancellationToken,
) -> WorkloadContext {
    let observer: SharedObserver = observer;
    WorkloadContext::new(controller, observer, cancel)
        .with_poll(poll_settings())
        .with_retry(retry_policy())
}

// ============================================================================
// Outcome builders
// ============================================================================

pub fn vm(scope: &str) -> Target {
    Target::vm("rhel-9-vm", scope)
}

pub fn bench_vm(index: u32) -> Target {
    vm(&format!("bench-{}", index))
}

pub fn instance(target: &Target) -> Target {
    target.related(target.id.clone(), ResourceKind::Instance)
}

pub fn data_volume(target: &Target) -> Target {
    target.related(format!("{}-volume", target.id), ResourceKind::DataVolume)
}

pub fn success(id: &str, running: f64) -> Outcome {
    Outcome::succeeded(Target::vm(id, "ns")).with_duration("running", running)
}

pub fn failure(id: &str, reason: FailureReason) -> Outcome {
    Outcome::failed(Target::vm(id, "ns"), reason, reason.as_str())
}

/// Fixed instant for migration timestamps.
pub fn at(seconds: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
        + chrono::Duration::seconds(i64::from(seconds))
}

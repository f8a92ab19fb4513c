//! # virtbench - resource-lifecycle benchmarks for KubeVirt
//!
//! virtbench drives many VM lifecycles at once against a cluster and
//! records how long each step took: creation to `Running`, volume clone,
//! resize, restart, snapshot and live migration. The capacity workload
//! keeps adding load until the cluster stops scheduling.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            CLI (clap)                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │          Workloads: creation, migration, capacity, cleanup          │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!          ┌──────────────┬──────────┼──────────┬──────────────┐
//!          ▼              ▼          ▼          ▼              ▼
//!     Dispatcher    State Poller   Retry    Duration       Aggregator
//!    (bounded N)   (phases, exh.)  Engine    Tracker     (RunSummary)
//!          │              │          │          │
//!          └──────────────┴──────────┼──────────┘
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │             ResourceController (KubeVirt adapter, mocks)            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine never talks to the cluster directly; everything goes through
//! [`ResourceController`](controller::ResourceController), so the whole
//! engine runs against scripted controllers in tests.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use virtbench::prelude::*;
//! use virtbench::workload::creation::{self, CreationSettings};
//!
//! let controller = Arc::new(KubeVirtController::connect(None, None).await?);
//! let ctx = WorkloadContext::new(controller, TracingObserver::shared(), CancellationToken::new());
//! let settings = CreationSettings::new(TargetRange::new("kubevirt-perf-test", 1, 10, "rhel-9-vm"));
//! let report = creation::run(&ctx, &settings).await?;
//! println!("{} of {} running", report.summary.successful, report.summary.total);
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Re-exports of the types most callers need.

    pub use crate::aggregate::{FailureReason, Outcome, RunSummary, TerminalReason};
    pub use crate::controller::{Location, Phase, ResourceController, ResourceSpec};
    pub use crate::dispatcher::{DispatchOrder, Dispatcher};
    pub use crate::error::{Error, Result};
    #[cfg(feature = "kubernetes")]
    pub use crate::kubevirt::KubeVirtController;
    pub use crate::poller::{PhaseVocabulary, PollSettings, StatePoller};
    pub use crate::report::{DetailRecord, ResultWriter, SummaryRecord};
    pub use crate::retry::{RetryEngine, RetryPolicy};
    pub use crate::target::{ResourceKind, Target, TargetRange};
    pub use crate::telemetry::{BenchmarkObserver, NullObserver, SharedObserver, TracingObserver};
    pub use crate::workload::{WorkloadContext, WorkloadReport};
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

// ============================================================================
// Core Engine
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Targets, resource kinds and target ranges.
pub mod target;

/// The control-plane seam: [`ResourceController`](controller::ResourceController)
/// and the values it exchanges.
pub mod controller;

/// Retry with exponential backoff for transient control-plane errors.
pub mod retry;

/// Polling a resource through its phases until it settles.
pub mod poller;

/// Observed versus authoritative durations of migration-class operations.
pub mod tracker;

/// Bounded-concurrency dispatch with early stop.
pub mod dispatcher;

/// Outcomes, run summaries and terminal reasons.
pub mod aggregate;

/// Repeat-until-exhausted outer loop.
pub mod capacity;

// ============================================================================
// Infrastructure
// ============================================================================

/// Observer handle and tracing setup.
pub mod telemetry;

/// Result records and their JSON/CSV files.
pub mod report;

/// VM manifest templates.
pub mod template;

/// Benchmark workloads built on the engine.
pub mod workload;

/// KubeVirt implementation of the controller seam.
#[cfg(feature = "kubernetes")]
pub mod kubevirt;

pub use error::{Error, Result};

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of virtbench.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns detailed version information including build metadata.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::ARCH,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        kubernetes: cfg!(feature = "kubernetes"),
    }
}

/// Build information shown by `virtbench --version` and in run banners.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    /// Whether the KubeVirt adapter is compiled in
    pub kubernetes: bool,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "virtbench {} ({}, {})", self.version, self.target, self.profile)?;
        if !self.kubernetes {
            write!(f, " [no kubernetes]")?;
        }
        Ok(())
    }
}

//! The control-plane boundary.
//!
//! [`ResourceController`] is the only way the engine talks to the platform.
//! Adapters translate control-plane responses into [`Phase`] values: a
//! resource that does not exist yet, or is not ready yet, is a phase and not
//! an error. Only genuine call failures (network, auth, rejected requests)
//! are returned as `Err`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::target::Target;

/// A named point in a resource's asynchronous lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// The resource does not exist (yet).
    Absent,
    /// A phase reported by the control plane.
    Named(String),
}

impl Phase {
    pub fn named(name: impl Into<String>) -> Self {
        Phase::Named(name.into())
    }

    /// Build a phase from an optional status field; a missing field maps to
    /// `Absent`.
    pub fn from_optional(name: Option<&str>) -> Self {
        match name {
            Some(n) if !n.is_empty() => Phase::named(n),
            _ => Phase::Absent,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        matches!(self, Phase::Named(n) if n == name)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Phase::Absent => "Absent",
            Phase::Named(n) => n,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build a phase set from names.
pub fn phases<I, S>(names: I) -> HashSet<Phase>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Phase::named).collect()
}

/// Where a resource currently runs (a node name for VMs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(pub String);

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Location(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rendered resource manifest ready for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// YAML manifest text
    pub manifest: String,
}

impl ResourceSpec {
    pub fn new(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }
}

/// Handle to a triggered migration object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigrationHandle {
    /// Name of the migration object
    pub name: String,
    /// The resource being migrated
    pub target: Target,
}

/// Authoritative timestamps reported for a migration object.
///
/// Each field is independently optional; absence is never replaced with a
/// default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTimestamps {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub phase: Phase,
}

impl MigrationTimestamps {
    pub fn absent() -> Self {
        Self {
            start: None,
            end: None,
            phase: Phase::Absent,
        }
    }
}

/// Operations the engine needs from the control plane.
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Create the scope if it does not exist.
    async fn ensure_scope(&self, scope: &str) -> Result<()>;

    /// Create a resource from a rendered manifest.
    async fn create(&self, target: &Target, spec: &ResourceSpec) -> Result<()>;

    /// Current lifecycle phase. Missing resources report [`Phase::Absent`].
    async fn status(&self, target: &Target) -> Result<Phase>;

    /// Current placement, `None` when the resource is not placed.
    async fn placement(&self, target: &Target) -> Result<Option<Location>>;

    /// Request a new size for a volume.
    async fn resize(&self, target: &Target, new_size: &str) -> Result<()>;

    /// Restart a VM.
    async fn restart(&self, target: &Target) -> Result<()>;

    /// Take a snapshot of a VM under the given name.
    async fn snapshot(&self, target: &Target, name: &str) -> Result<()>;

    /// Trigger a live migration.
    async fn migrate(&self, target: &Target, dest_hint: Option<&Location>)
        -> Result<MigrationHandle>;

    /// Authoritative start/end timestamps and phase of a migration object.
    async fn migration_timestamps(&self, handle: &MigrationHandle) -> Result<MigrationTimestamps>;

    /// Delete a resource or a whole scope.
    async fn delete(&self, target: &Target) -> Result<()>;

    /// Halt a VM, keeping its definition.
    async fn stop(&self, target: &Target) -> Result<()> {
        let _ = target;
        Err(Error::Unsupported("stop".into()))
    }

    /// Start a halted VM.
    async fn start(&self, target: &Target) -> Result<()> {
        let _ = target;
        Err(Error::Unsupported("start".into()))
    }

    /// Mark a location schedulable again after it failed.
    async fn uncordon(&self, location: &Location) -> Result<()> {
        let _ = location;
        Err(Error::Unsupported("uncordon".into()))
    }

    /// Locations available for placement (worker nodes).
    async fn locations(&self) -> Result<Vec<Location>> {
        Err(Error::Unsupported("locations".into()))
    }

    /// Volumes attached to a VM.
    async fn volumes(&self, target: &Target) -> Result<Vec<Target>> {
        let _ = target;
        Ok(Vec::new())
    }

    /// Requested size of a volume, e.g. `30Gi`.
    async fn volume_size(&self, target: &Target) -> Result<Option<String>> {
        let _ = target;
        Ok(None)
    }
}

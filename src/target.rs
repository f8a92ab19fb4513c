//! Resource identities and operation requests.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::retry::RetryPolicy;

/// The kind of control-plane object a [`Target`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// A virtual machine.
    VirtualMachine,
    /// A persistent volume claim attached to a VM.
    Volume,
    /// A VM snapshot.
    Snapshot,
    /// A clone-backed data volume.
    DataVolume,
    /// A live-migration job.
    Migration,
    /// The running instance behind a VM.
    Instance,
    /// The scope (namespace) itself.
    Scope,
}

impl ResourceKind {
    /// Short name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::VirtualMachine => "vm",
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::DataVolume => "datavolume",
            ResourceKind::Migration => "migration",
            ResourceKind::Instance => "vmi",
            ResourceKind::Scope => "scope",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of one resource under test.
///
/// Targets are created when a workload enumerates its range and are only
/// torn down by an explicit cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Resource name within its scope
    pub id: String,
    /// Logical grouping (namespace)
    pub scope: String,
    /// Resource kind
    pub kind: ResourceKind,
}

impl Target {
    /// Create a new target.
    pub fn new(id: impl Into<String>, scope: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            scope: scope.into(),
            kind,
        }
    }

    /// A virtual machine target.
    pub fn vm(id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::new(id, scope, ResourceKind::VirtualMachine)
    }

    /// The scope itself as a deletable target.
    pub fn scope(scope: impl Into<String>) -> Self {
        let scope = scope.into();
        Self::new(scope.clone(), scope, ResourceKind::Scope)
    }

    /// Another resource living in the same scope.
    pub fn related(&self, id: impl Into<String>, kind: ResourceKind) -> Self {
        Self::new(id, self.scope.clone(), kind)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == ResourceKind::Scope {
            write!(f, "{}", self.scope)
        } else {
            write!(f, "{}/{}", self.scope, self.id)
        }
    }
}

impl AsRef<Target> for Target {
    fn as_ref(&self) -> &Target {
        self
    }
}

/// Operations a workload can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Resize,
    Restart,
    Snapshot,
    Migrate,
    Stop,
    Start,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Resize => "resize",
            OperationKind::Restart => "restart",
            OperationKind::Snapshot => "snapshot",
            OperationKind::Migrate => "migrate",
            OperationKind::Stop => "stop",
            OperationKind::Start => "start",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work handed to the dispatcher.
///
/// Requests are assembled with the builder methods and are immutable once
/// submitted: the dispatcher only ever hands out shared references.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    target: Target,
    kind: OperationKind,
    parameters: IndexMap<String, String>,
    retry_policy: RetryPolicy,
}

impl OperationRequest {
    /// Create a request with no parameters.
    pub fn new(target: Target, kind: OperationKind, retry_policy: RetryPolicy) -> Self {
        Self {
            target,
            kind,
            parameters: IndexMap::new(),
            retry_policy,
        }
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn parameters(&self) -> &IndexMap<String, String> {
        &self.parameters
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// `"{kind} {target}"`, used as the retry label.
    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.target)
    }
}

impl AsRef<Target> for OperationRequest {
    fn as_ref(&self) -> &Target {
        &self.target
    }
}

/// A numeric range of scopes, one target per scope.
///
/// `prefix = "bench", start = 1, end = 3` yields scopes `bench-1`, `bench-2`
/// and `bench-3`, each holding one VM called `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRange {
    pub prefix: String,
    pub start: u32,
    pub end: u32,
    pub name: String,
}

impl TargetRange {
    pub fn new(prefix: impl Into<String>, start: u32, end: u32, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            start,
            end,
            name: name.into(),
        }
    }

    /// Number of targets in the range (inclusive on both ends).
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scope names in order.
    pub fn scopes(&self) -> Vec<String> {
        (self.start..=self.end)
            .map(|i| format!("{}-{}", self.prefix, i))
            .collect()
    }

    /// VM targets in order.
    pub fn targets(&self) -> Vec<Target> {
        self.scopes()
            .into_iter()
            .map(|scope| Target::vm(self.name.clone(), scope))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        let range = TargetRange::new("kv-perf-test", 3, 5, "rhel-9-vm");
        let targets = range.targets();
        assert_eq!(range.len(), 3);
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].scope, "kv-perf-test-3");
        assert_eq!(targets[2].scope, "kv-perf-test-5");
        assert!(targets.iter().all(|t| t.id == "rhel-9-vm"));
    }

    #[test]
    fn empty_range() {
        let range = TargetRange::new("x", 5, 4, "vm");
        assert!(range.is_empty());
        assert!(range.targets().is_empty());
    }

    #[test]
    fn display() {
        assert_eq!(Target::vm("vm-1", "ns-1").to_string(), "ns-1/vm-1");
        assert_eq!(Target::scope("ns-1").to_string(), "ns-1");
        let vol = Target::vm("vm-1", "ns-1").related("vm-1-volume", ResourceKind::DataVolume);
        assert_eq!(vol.scope, "ns-1");
        assert_eq!(vol.kind, ResourceKind::DataVolume);
    }

    #[test]
    fn request_parameters() {
        let req = OperationRequest::new(
            Target::vm("vm-1", "ns-1"),
            OperationKind::Resize,
            RetryPolicy::default(),
        )
        .with_parameter("size", "40Gi");
        assert_eq!(req.parameter("size"), Some("40Gi"));
        assert_eq!(req.parameter("missing"), None);
        assert_eq!(req.kind(), OperationKind::Resize);
        assert_eq!(req.as_ref().id, "vm-1");
        assert_eq!(req.label(), "resize ns-1/vm-1");
    }
}

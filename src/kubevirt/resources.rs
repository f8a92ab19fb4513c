//! KubeVirt and CDI resource kinds, and the parts of their status the
//! benchmark reads.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::controller::Phase;
use crate::error::Result;
use crate::workload::capacity::parse_size_gi;

/// Group, version and kind of a custom resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

impl CustomKind {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(self.group, self.version, self.kind))
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

pub const VIRTUAL_MACHINE: CustomKind = CustomKind {
    group: "kubevirt.io",
    version: "v1",
    kind: "VirtualMachine",
};

pub const VIRTUAL_MACHINE_INSTANCE: CustomKind = CustomKind {
    group: "kubevirt.io",
    version: "v1",
    kind: "VirtualMachineInstance",
};

pub const VIRTUAL_MACHINE_INSTANCE_MIGRATION: CustomKind = CustomKind {
    group: "kubevirt.io",
    version: "v1",
    kind: "VirtualMachineInstanceMigration",
};

pub const DATA_VOLUME: CustomKind = CustomKind {
    group: "cdi.kubevirt.io",
    version: "v1beta1",
    kind: "DataVolume",
};

pub const VIRTUAL_MACHINE_SNAPSHOT: CustomKind = CustomKind {
    group: "snapshot.kubevirt.io",
    version: "v1beta1",
    kind: "VirtualMachineSnapshot",
};

/// Label carried by worker nodes.
pub const WORKER_LABEL: &str = "node-role.kubernetes.io/worker";

/// Split an `apiVersion` into group and version. Core resources have no group.
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub printable_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmiStatus {
    pub node_name: Option<String>,
    pub phase: Option<String>,
    pub migration_state: Option<MigrationState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub interfaces: Vec<VmiInterface>,
}

impl VmiStatus {
    /// `Ready` once the instance runs, its Ready condition is true and it has
    /// an address; otherwise the raw phase.
    pub fn to_recovery_phase(&self) -> Phase {
        let running = self.phase.as_deref() == Some("Running");
        let ready = self
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        let addressed = self
            .interfaces
            .iter()
            .any(|i| i.ip_address.as_deref().is_some_and(|ip| !ip.is_empty()));
        if running && ready && addressed {
            Phase::named("Ready")
        } else {
            Phase::from_optional(self.phase.as_deref())
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmiInterface {
    pub ip_address: Option<String>,
}

/// `status.migrationState` of a VMI: the control plane's own record of the
/// most recent migration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub migration_uid: Option<String>,
    pub completed: Option<bool>,
    pub failed: Option<bool>,
}

impl MigrationState {
    /// Whether this state belongs to the migration object with `uid`. States
    /// without a uid are accepted.
    pub fn belongs_to(&self, uid: Option<&str>) -> bool {
        match (self.migration_uid.as_deref(), uid) {
            (Some(state), Some(object)) => state == object,
            _ => true,
        }
    }
}

/// Status of resources that only report `status.phase` (DataVolume,
/// VirtualMachineInstanceMigration).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseStatus {
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    pub phase: Option<String>,
    pub ready_to_use: Option<bool>,
}

impl SnapshotStatus {
    /// `Ready` once usable, otherwise the reported phase.
    pub fn to_phase(&self) -> Phase {
        if self.ready_to_use == Some(true) {
            Phase::named("Ready")
        } else {
            Phase::from_optional(self.phase.as_deref())
        }
    }
}

/// Typed view of a dynamic object's `status`. Objects without a status yet
/// read as the default.
pub fn status_of<T: DeserializeOwned + Default>(object: &DynamicObject) -> Result<T> {
    match object.data.get("status") {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(status) => Ok(serde_json::from_value(status.clone())?),
    }
}

/// Claims backing a VM's disks, from `spec.template.spec.volumes`.
pub fn vm_volume_claims(vm: &DynamicObject) -> Vec<String> {
    let Some(volumes) = vm
        .data
        .pointer("/spec/template/spec/volumes")
        .and_then(serde_json::Value::as_array)
    else {
        return Vec::new();
    };

    volumes
        .iter()
        .filter_map(|volume| {
            volume
                .pointer("/dataVolume/name")
                .or_else(|| volume.pointer("/persistentVolumeClaim/claimName"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

/// Requested storage of a claim.
pub fn pvc_requested(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

fn pvc_capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

fn same_size(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    matches!((parse_size_gi(a), parse_size_gi(b)), (Ok(x), Ok(y)) if x == y)
}

/// `Lost` when the claim lost its volume, `Resized` once the reported
/// capacity matches the request, `Resizing` before that.
pub fn pvc_phase(pvc: &PersistentVolumeClaim) -> Phase {
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some("Lost") {
        return Phase::named("Lost");
    }
    match (pvc_requested(pvc), pvc_capacity(pvc)) {
        (Some(requested), Some(capacity)) if same_size(&requested, &capacity) => Phase::named("Resized"),
        _ => Phase::named("Resizing"),
    }
}

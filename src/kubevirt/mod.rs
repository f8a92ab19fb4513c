//! [`ResourceController`] over the Kubernetes API for KubeVirt clusters.
//!
//! Scopes are namespaces, locations are worker nodes. VMs, VMIs, migrations,
//! DataVolumes and snapshots are handled as dynamic objects; namespaces,
//! nodes and claims use the typed `k8s-openapi` structs.
//!
//! Missing objects read as [`Phase::Absent`] or `None`, never as errors.
//! Every other API error is returned with the server's message intact so
//! the retry vocabulary can match it.

pub mod resources;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
        PostParams,
    },
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::path::Path;

use crate::controller::{
    Location, MigrationHandle, MigrationTimestamps, Phase, ResourceController, ResourceSpec,
};
use crate::error::{Error, Result};
use crate::target::{ResourceKind, Target};
use resources::{
    parse_api_version, pvc_phase, pvc_requested, status_of, vm_volume_claims, CustomKind, PhaseStatus,
    SnapshotStatus, VmStatus, VmiStatus, DATA_VOLUME, VIRTUAL_MACHINE, VIRTUAL_MACHINE_INSTANCE,
    VIRTUAL_MACHINE_INSTANCE_MIGRATION, VIRTUAL_MACHINE_SNAPSHOT, WORKER_LABEL,
};

fn api_error(operation: &str, target: impl ToString, error: kube::Error) -> Error {
    Error::control_plane(operation, target.to_string(), error.to_string())
}

/// KubeVirt cluster reached through a kubeconfig.
#[derive(Clone)]
pub struct KubeVirtController {
    client: Client,
}

impl KubeVirtController {
    /// Connect using `kubeconfig` (or the default lookup: `$KUBECONFIG`,
    /// `~/.kube/config`, in-cluster) and an optional context.
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<String>) -> Result<Self> {
        let config = match (kubeconfig, context) {
            (None, None) => Config::infer()
                .await
                .map_err(|e| Error::Config(format!("Failed to infer cluster config: {}", e)))?,
            (path, context) => {
                let kubeconfig = match path {
                    Some(path) => Kubeconfig::read_from(path).map_err(|e| {
                        Error::Config(format!("Failed to read kubeconfig from {}: {}", path.display(), e))
                    })?,
                    None => Kubeconfig::read()
                        .map_err(|e| Error::Config(format!("Failed to read default kubeconfig: {}", e)))?,
                };
                let options = KubeConfigOptions {
                    context,
                    cluster: None,
                    user: None,
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::Config(format!("Failed to create config from kubeconfig: {}", e)))?
            }
        };

        tracing::debug!(cluster = %config.cluster_url, "Connecting to cluster");
        let client = Client::try_from(config)
            .map_err(|e| Error::Config(format!("Failed to create client: {}", e)))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn custom(&self, kind: &CustomKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_custom(&self, kind: &CustomKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        self.custom(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| api_error("get", format!("{}/{} {}", namespace, name, kind.kind), e))
    }

    async fn custom_phase(&self, kind: &CustomKind, target: &Target) -> Result<Phase> {
        let Some(object) = self.get_custom(kind, &target.scope, &target.id).await? else {
            return Ok(Phase::Absent);
        };
        let phase = match target.kind {
            ResourceKind::VirtualMachine => {
                Phase::from_optional(status_of::<VmStatus>(&object)?.printable_status.as_deref())
            }
            ResourceKind::Snapshot => status_of::<SnapshotStatus>(&object)?.to_phase(),
            ResourceKind::Instance => status_of::<VmiStatus>(&object)?.to_recovery_phase(),
            _ => Phase::from_optional(status_of::<PhaseStatus>(&object)?.phase.as_deref()),
        };
        Ok(phase)
    }

    async fn worker_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let workers = nodes
            .list(&ListParams::default().labels(WORKER_LABEL))
            .await
            .map_err(|e| api_error("list nodes", WORKER_LABEL, e))?;
        if !workers.items.is_empty() {
            return Ok(workers.items);
        }
        tracing::debug!("No nodes labelled as workers; using all nodes");
        let all = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| api_error("list nodes", "all", e))?;
        Ok(all.items)
    }

    async fn set_run_strategy(&self, target: &Target, strategy: &str, operation: &str) -> Result<()> {
        let patch = json!({"spec": {"runStrategy": strategy}});
        self.custom(&VIRTUAL_MACHINE, &target.scope)
            .patch(&target.id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(operation, target, e))?;
        tracing::debug!(target = %target, run_strategy = strategy, "Run strategy set");
        Ok(())
    }
}

/// Delete `name`, treating an already missing object as deleted.
async fn delete_named<K>(api: Api<K>, name: &str, target: &Target) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(api_error("delete", target, e)),
    }
}

fn custom_kind_of(kind: ResourceKind) -> Option<&'static CustomKind> {
    match kind {
        ResourceKind::VirtualMachine => Some(&VIRTUAL_MACHINE),
        ResourceKind::DataVolume => Some(&DATA_VOLUME),
        ResourceKind::Snapshot => Some(&VIRTUAL_MACHINE_SNAPSHOT),
        ResourceKind::Migration => Some(&VIRTUAL_MACHINE_INSTANCE_MIGRATION),
        ResourceKind::Instance => Some(&VIRTUAL_MACHINE_INSTANCE),
        ResourceKind::Volume | ResourceKind::Scope => None,
    }
}

#[async_trait]
impl ResourceController for KubeVirtController {
    async fn ensure_scope(&self, scope: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(scope.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                tracing::debug!(namespace = scope, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(api_error("create namespace", scope, e)),
        }
    }

    async fn create(&self, target: &Target, spec: &ResourceSpec) -> Result<()> {
        let mut object: DynamicObject = serde_yaml::from_str(&spec.manifest)?;
        let types = object
            .types
            .clone()
            .ok_or_else(|| Error::InvalidArgument("manifest has no apiVersion/kind".into()))?;
        let (group, version) = parse_api_version(&types.api_version);
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &types.kind));

        object.metadata.namespace = Some(target.scope.clone());
        if object.metadata.name.is_none() {
            object.metadata.name = Some(target.id.clone());
        }

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &target.scope, &resource);
        api.create(&PostParams::default(), &object)
            .await
            .map_err(|e| api_error("create", target, e))?;
        tracing::debug!(target = %target, kind = %types.kind, "Created");
        Ok(())
    }

    async fn status(&self, target: &Target) -> Result<Phase> {
        if let Some(kind) = custom_kind_of(target.kind) {
            return self.custom_phase(kind, target).await;
        }
        match target.kind {
            ResourceKind::Volume => {
                let pvc = self
                    .claims(&target.scope)
                    .get_opt(&target.id)
                    .await
                    .map_err(|e| api_error("get", target, e))?;
                Ok(pvc.as_ref().map(pvc_phase).unwrap_or(Phase::Absent))
            }
            _ => {
                let namespaces: Api<Namespace> = Api::all(self.client.clone());
                let namespace = namespaces
                    .get_opt(&target.scope)
                    .await
                    .map_err(|e| api_error("get namespace", &target.scope, e))?;
                Ok(Phase::from_optional(
                    namespace
                        .as_ref()
                        .and_then(|ns| ns.status.as_ref())
                        .and_then(|s| s.phase.as_deref()),
                ))
            }
        }
    }

    async fn placement(&self, target: &Target) -> Result<Option<Location>> {
        let Some(vmi) = self
            .get_custom(&VIRTUAL_MACHINE_INSTANCE, &target.scope, &target.id)
            .await?
        else {
            return Ok(None);
        };
        let status: VmiStatus = status_of(&vmi)?;
        Ok(status.node_name.filter(|n| !n.is_empty()).map(Location::new))
    }

    async fn resize(&self, target: &Target, new_size: &str) -> Result<()> {
        let patch = json!({
            "spec": {"resources": {"requests": {"storage": new_size}}}
        });
        self.claims(&target.scope)
            .patch(&target.id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error("resize", target, e))?;
        Ok(())
    }

    /// Deletes the running instance; the VM's run strategy brings up a new
    /// one.
    async fn restart(&self, target: &Target) -> Result<()> {
        delete_named(
            self.custom(&VIRTUAL_MACHINE_INSTANCE, &target.scope),
            &target.id,
            target,
        )
        .await
    }

    async fn stop(&self, target: &Target) -> Result<()> {
        self.set_run_strategy(target, "Halted", "stop").await
    }

    async fn start(&self, target: &Target) -> Result<()> {
        self.set_run_strategy(target, "Always", "start").await
    }

    async fn uncordon(&self, location: &Location) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"spec": {"unschedulable": false}});
        nodes
            .patch(location.as_str(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error("uncordon", location, e))?;
        tracing::info!(node = %location, "Node uncordoned");
        Ok(())
    }

    async fn snapshot(&self, target: &Target, name: &str) -> Result<()> {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": VIRTUAL_MACHINE_SNAPSHOT.api_version(),
            "kind": VIRTUAL_MACHINE_SNAPSHOT.kind,
            "metadata": {"name": name, "namespace": target.scope},
            "spec": {
                "source": {
                    "apiGroup": VIRTUAL_MACHINE.group,
                    "kind": VIRTUAL_MACHINE.kind,
                    "name": target.id,
                }
            }
        }))?;
        self.custom(&VIRTUAL_MACHINE_SNAPSHOT, &target.scope)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| api_error("snapshot", target, e))?;
        Ok(())
    }

    async fn migrate(&self, target: &Target, _dest_hint: Option<&Location>) -> Result<MigrationHandle> {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": VIRTUAL_MACHINE_INSTANCE_MIGRATION.api_version(),
            "kind": VIRTUAL_MACHINE_INSTANCE_MIGRATION.kind,
            "metadata": {
                "generateName": format!("{}-migration-", target.id),
                "namespace": target.scope,
            },
            "spec": {"vmiName": target.id}
        }))?;
        let created = self
            .custom(&VIRTUAL_MACHINE_INSTANCE_MIGRATION, &target.scope)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| api_error("migrate", target, e))?;
        let name = created
            .metadata
            .name
            .ok_or_else(|| Error::unexpected(target.to_string(), "migration object has no name"))?;
        tracing::debug!(target = %target, migration = %name, "Migration requested");
        Ok(MigrationHandle {
            name,
            target: target.clone(),
        })
    }

    async fn migration_timestamps(&self, handle: &MigrationHandle) -> Result<MigrationTimestamps> {
        let scope = &handle.target.scope;
        let Some(migration) = self
            .get_custom(&VIRTUAL_MACHINE_INSTANCE_MIGRATION, scope, &handle.name)
            .await?
        else {
            return Ok(MigrationTimestamps::absent());
        };
        let phase = Phase::from_optional(status_of::<PhaseStatus>(&migration)?.phase.as_deref());
        let uid = migration.metadata.uid.as_deref();

        let state = match self
            .get_custom(&VIRTUAL_MACHINE_INSTANCE, scope, &handle.target.id)
            .await?
        {
            Some(vmi) => status_of::<VmiStatus>(&vmi)?
                .migration_state
                .filter(|state| state.belongs_to(uid)),
            None => None,
        };

        Ok(MigrationTimestamps {
            start: state.as_ref().and_then(|s| s.start_timestamp),
            end: state.as_ref().and_then(|s| s.end_timestamp),
            phase,
        })
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        if let Some(kind) = custom_kind_of(target.kind) {
            return delete_named(self.custom(kind, &target.scope), &target.id, target).await;
        }
        match target.kind {
            ResourceKind::Volume => delete_named(self.claims(&target.scope), &target.id, target).await,
            _ => {
                let namespaces: Api<Namespace> = Api::all(self.client.clone());
                delete_named(namespaces, &target.scope, target).await
            }
        }
    }

    async fn locations(&self) -> Result<Vec<Location>> {
        let mut names: Vec<String> = self
            .worker_nodes()
            .await?
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect();
        names.sort();
        Ok(names.into_iter().map(Location::new).collect())
    }

    async fn volumes(&self, target: &Target) -> Result<Vec<Target>> {
        let Some(vm) = self.get_custom(&VIRTUAL_MACHINE, &target.scope, &target.id).await? else {
            return Ok(Vec::new());
        };
        Ok(vm_volume_claims(&vm)
            .into_iter()
            .map(|claim| target.related(claim, ResourceKind::Volume))
            .collect())
    }

    async fn volume_size(&self, target: &Target) -> Result<Option<String>> {
        let pvc = self
            .claims(&target.scope)
            .get_opt(&target.id)
            .await
            .map_err(|e| api_error("get", target, e))?;
        Ok(pvc.as_ref().and_then(pvc_requested))
    }
}

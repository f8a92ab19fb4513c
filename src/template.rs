//! VM manifest rendering.
//!
//! Templates are YAML with `{{PLACEHOLDER}}` variables rendered by minijinja
//! in strict mode, so a placeholder without a value is an error rather than
//! an empty string.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::path::Path;

use crate::error::{Error, Result};

/// Template used when no file is given: one VM booting from a clone of a
/// DataSource.
pub const DEFAULT_VM_TEMPLATE: &str = r#"apiVersion: kubevirt.io/v1
kind: VirtualMachine
metadata:
  name: {{VM_NAME}}
  labels:
    app.kubernetes.io/managed-by: virtbench
spec:
  runStrategy: Always
  dataVolumeTemplates:
  - metadata:
      name: {{VM_NAME}}-volume
    spec:
      sourceRef:
        kind: DataSource
        name: {{DATASOURCE_NAME}}
        namespace: {{DATASOURCE_NAMESPACE}}
      storage:
        storageClassName: {{STORAGE_CLASS_NAME}}
        resources:
          requests:
            storage: {{STORAGE_SIZE}}
  template:
    metadata:
      labels:
        kubevirt.io/vm: {{VM_NAME}}
    spec:
      domain:
        cpu:
          cores: {{VM_CPU_CORES}}
        memory:
          guest: {{VM_MEMORY}}
        devices:
          disks:
          - name: rootdisk
            disk:
              bus: virtio
      volumes:
      - name: rootdisk
        dataVolume:
          name: {{VM_NAME}}-volume
"#;

/// Values substituted into a VM template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmTemplateValues {
    #[serde(rename = "VM_NAME")]
    pub vm_name: String,
    #[serde(rename = "STORAGE_CLASS_NAME")]
    pub storage_class: String,
    #[serde(rename = "DATASOURCE_NAME")]
    pub datasource_name: String,
    #[serde(rename = "DATASOURCE_NAMESPACE")]
    pub datasource_namespace: String,
    #[serde(rename = "STORAGE_SIZE")]
    pub storage_size: String,
    #[serde(rename = "VM_MEMORY")]
    pub vm_memory: String,
    #[serde(rename = "VM_CPU_CORES")]
    pub vm_cpu_cores: u32,
}

impl VmTemplateValues {
    /// Same values for a different VM name.
    pub fn for_vm(&self, vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            ..self.clone()
        }
    }
}

impl Default for VmTemplateValues {
    fn default() -> Self {
        Self {
            vm_name: "rhel-9-vm".into(),
            storage_class: "standard".into(),
            datasource_name: "rhel9".into(),
            datasource_namespace: "openshift-virtualization-os-images".into(),
            storage_size: "30Gi".into(),
            vm_memory: "2Gi".into(),
            vm_cpu_cores: 1,
        }
    }
}

/// A loaded VM template.
#[derive(Debug, Clone)]
pub struct VmTemplate {
    name: String,
    source: String,
}

impl VmTemplate {
    pub fn builtin() -> Self {
        Self::from_source("builtin", DEFAULT_VM_TEMPLATE)
    }

    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let source = std::fs::read_to_string(path)?;
        Ok(Self::from_source(path.display().to_string(), source))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render with every placeholder filled in.
    pub fn render(&self, values: &VmTemplateValues) -> Result<String> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let rendered = env
            .render_str(&self.source, values)
            .map_err(|e| Error::template_render(&self.name, e.to_string()))?;
        Ok(rendered)
    }

    /// Render and pin the VM to a node via `kubernetes.io/hostname`.
    pub fn render_on_node(&self, values: &VmTemplateValues, node: Option<&str>) -> Result<String> {
        let rendered = self.render(values)?;
        match node {
            None => Ok(rendered),
            Some(node) => pin_to_node(&rendered, node)
                .map_err(|message| Error::template_render(&self.name, message)),
        }
    }
}

fn pin_to_node(manifest: &str, node: &str) -> std::result::Result<String, String> {
    let mut doc: Value = serde_yaml::from_str(manifest).map_err(|e| e.to_string())?;

    let pod_spec = ["spec", "template", "spec"]
        .iter()
        .try_fold(&mut doc, |value, key| {
            value
                .as_mapping_mut()
                .and_then(|m| m.get_mut(*key))
                .ok_or_else(|| format!("manifest has no {}", key))
        })?
        .as_mapping_mut()
        .ok_or_else(|| "spec.template.spec is not a mapping".to_string())?;

    let mut selector = Mapping::new();
    selector.insert(
        Value::String("kubernetes.io/hostname".into()),
        Value::String(node.into()),
    );
    pod_spec.insert(Value::String("nodeSelector".into()), Value::Mapping(selector));

    serde_yaml::to_string(&doc).map_err(|e| e.to_string())
}

//! Subcommands module for virtbench CLI
//!
//! Each subcommand turns its arguments plus the loaded [`Config`] into
//! workload settings, runs the workload and hands the report to
//! [`CommandContext::finish`].

pub mod capacity;
pub mod cleanup;
pub mod creation;
pub mod migration;
pub mod recovery;

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cli::output::OutputFormatter;
use crate::cli::progress::{self, ProgressObserver};
use crate::cli::{parse_duration, Cli};
use crate::config::Config;
use virtbench::controller::ResourceController;
use virtbench::error::Error;
use virtbench::report::ResultWriter;
use virtbench::target::TargetRange;
use virtbench::telemetry::{CompositeObserver, TracingObserver};
use virtbench::template::{VmTemplate, VmTemplateValues};
use virtbench::workload::cleanup::delete_scopes;
use virtbench::workload::{WorkloadContext, WorkloadReport};

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
    /// Output formatter
    pub output: OutputFormatter,
    /// Kubeconfig override
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context override
    pub kube_context: Option<String>,
    /// Cancelled on Ctrl-C
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &Cli, mut config: Config, cancel: CancellationToken) -> Self {
        if let Some(dir) = &cli.results_dir {
            config.output.results_dir = dir.clone();
        }
        let use_color = !cli.no_color && config.output.color;
        let output = OutputFormatter::new(use_color, cli.is_json(), cli.verbosity());

        Self {
            config,
            output,
            kubeconfig: cli.kubeconfig.clone(),
            kube_context: cli.context.clone(),
            cancel,
        }
    }

    /// Connect to the cluster
    #[cfg(feature = "kubernetes")]
    pub async fn controller(&self) -> Result<Arc<dyn ResourceController>> {
        let controller =
            virtbench::kubevirt::KubeVirtController::connect(self.kubeconfig.as_deref(), self.kube_context.clone())
                .await
                .context("Failed to connect to the cluster")?;
        Ok(Arc::new(controller))
    }

    #[cfg(not(feature = "kubernetes"))]
    pub async fn controller(&self) -> Result<Arc<dyn ResourceController>> {
        anyhow::bail!("virtbench was built without the `kubernetes` feature")
    }

    /// Workload handles with tracing and a progress bar attached
    pub fn workload_context(
        &self,
        controller: Arc<dyn ResourceController>,
        progress: &Arc<ProgressObserver>,
        poll: &PollArgs,
    ) -> WorkloadContext {
        let observer = CompositeObserver::new()
            .with(TracingObserver::shared())
            .with(progress::as_shared(progress));

        WorkloadContext::new(controller, Arc::new(observer), self.cancel.clone())
            .with_poll(poll.poll_settings(&self.config))
            .with_retry(poll.retry_policy(&self.config))
    }

    pub fn progress(&self, workload: &str) -> Arc<ProgressObserver> {
        ProgressObserver::shared(workload, !self.output.is_json())
    }

    /// Persist and print a finished workload. Returns the writer so callers
    /// can add workload-specific files next to the standard ones.
    pub fn finish(&self, report: &WorkloadReport, progress: &ProgressObserver) -> Result<ResultWriter> {
        progress.finish();

        let writer = ResultWriter::new(&self.config.output.results_dir, &report.workload, report.started_at);
        let details = report.details();
        let summary = report.summary_record();
        writer
            .write_details(&details)
            .context("Failed to write detail records")?;
        writer
            .write_summary(&summary)
            .context("Failed to write summary record")?;

        self.output.summary(&summary, &details);
        self.output
            .info(&format!("Results written to {}", writer.dir().display()));
        Ok(writer)
    }

    /// Delete `scopes` after a workload when `--cleanup` was given
    pub async fn cleanup_scopes(&self, workload: &WorkloadContext, scopes: Vec<String>) -> i32 {
        self.output.section("Cleanup");
        let concurrency = self.config.defaults.cleanup_concurrency;
        // A Ctrl-C during the run must not stop the teardown.
        let teardown = WorkloadContext {
            cancel: CancellationToken::new(),
            ..workload.clone()
        };
        let report = delete_scopes(&teardown, scopes, concurrency).await;
        if report.summary.failed > 0 {
            self.output.warning(&format!(
                "{} of {} namespaces could not be deleted",
                report.summary.failed, report.summary.total
            ));
        } else {
            self.output
                .info(&format!("Deleted {} namespaces", report.summary.total));
        }
        report.exit_code()
    }
}

/// Trait for runnable commands
#[async_trait::async_trait]
pub trait Runnable {
    /// Execute the command
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32>;
}

/// Numeric range of namespaces and the VM name used in each
#[derive(Args, Debug, Clone)]
pub struct RangeArgs {
    /// Start index for test namespaces
    #[arg(short = 's', long, default_value_t = 1)]
    pub start: u32,

    /// End index for test namespaces (inclusive)
    #[arg(short = 'e', long, default_value_t = 10)]
    pub end: u32,

    /// Namespace prefix; namespaces are `{prefix}-{index}`
    #[arg(long, default_value = "kubevirt-perf-test")]
    pub namespace_prefix: String,

    /// VM name inside each namespace
    #[arg(long, default_value = "rhel-9-vm")]
    pub vm_name: String,
}

impl RangeArgs {
    pub fn target_range(&self) -> Result<TargetRange> {
        if self.end < self.start {
            return Err(Error::InvalidArgument(format!(
                "--end ({}) must not be less than --start ({})",
                self.end, self.start
            ))
            .into());
        }
        Ok(TargetRange::new(
            self.namespace_prefix.clone(),
            self.start,
            self.end,
            self.vm_name.clone(),
        ))
    }
}

/// VM template and the values substituted into it
#[derive(Args, Debug, Clone)]
pub struct TemplateArgs {
    /// VM manifest template; the built-in template when unset
    #[arg(long)]
    pub vm_template: Option<PathBuf>,

    /// DataSource to clone the root disk from
    #[arg(long, default_value = "rhel9")]
    pub datasource_name: String,

    /// Namespace of the DataSource
    #[arg(long, default_value = "openshift-virtualization-os-images")]
    pub datasource_namespace: String,

    /// Root disk size
    #[arg(long, default_value = "30Gi")]
    pub storage_size: String,

    /// VM memory
    #[arg(long, default_value = "2Gi")]
    pub vm_memory: String,

    /// VM CPU cores
    #[arg(long, default_value_t = 1)]
    pub vm_cpu_cores: u32,
}

impl TemplateArgs {
    pub fn template(&self) -> Result<VmTemplate> {
        match &self.vm_template {
            Some(path) => VmTemplate::from_file(path)
                .with_context(|| format!("Failed to load VM template {}", path.display())),
            None => Ok(VmTemplate::builtin()),
        }
    }

    pub fn values(&self, vm_name: &str, storage_class: Option<&str>) -> VmTemplateValues {
        let defaults = VmTemplateValues::default();
        VmTemplateValues {
            vm_name: vm_name.to_string(),
            storage_class: storage_class.map(str::to_string).unwrap_or(defaults.storage_class),
            datasource_name: self.datasource_name.clone(),
            datasource_namespace: self.datasource_namespace.clone(),
            storage_size: self.storage_size.clone(),
            vm_memory: self.vm_memory.clone(),
            vm_cpu_cores: self.vm_cpu_cores,
        }
    }
}

/// Poll and retry overrides; unset values come from the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct PollArgs {
    /// Time between status checks (`5`, `5s`, `500ms`)
    #[arg(long, value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Upper bound for any single wait
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Time in `Scheduling` after which the cluster counts as full
    #[arg(long, value_parser = parse_duration)]
    pub scheduling_timeout: Option<Duration>,

    /// Attempts per control-plane call
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl PollArgs {
    pub fn poll_settings(&self, config: &Config) -> virtbench::poller::PollSettings {
        let mut settings = config.poll_settings();
        if let Some(interval) = self.poll_interval {
            settings.poll_interval = interval;
        }
        if let Some(timeout) = self.timeout {
            settings.global_timeout = timeout;
        }
        if let Some(timeout) = self.scheduling_timeout {
            settings.exhaustion_timeout = timeout;
        }
        settings
    }

    pub fn retry_policy(&self, config: &Config) -> virtbench::retry::RetryPolicy {
        let mut config = config.clone();
        if let Some(attempts) = self.max_retries {
            config.retry.max_attempts = attempts;
        }
        config.retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        let range = RangeArgs {
            start: 5,
            end: 2,
            namespace_prefix: "ns".into(),
            vm_name: "vm".into(),
        };
        assert!(range.target_range().is_err());

        let range = RangeArgs { end: 7, ..range };
        assert_eq!(range.target_range().unwrap().len(), 3);
    }

    #[test]
    fn test_poll_args_override_config() {
        let config = Config::default();
        let args = PollArgs {
            poll_interval: Some(Duration::from_secs(1)),
            scheduling_timeout: Some(Duration::from_secs(30)),
            max_retries: Some(2),
            ..PollArgs::default()
        };
        let poll = args.poll_settings(&config);
        assert_eq!(poll.poll_interval, Duration::from_secs(1));
        assert_eq!(poll.exhaustion_timeout, Duration::from_secs(30));
        assert_eq!(poll.global_timeout, config.defaults.global_timeout);
        assert_eq!(args.retry_policy(&config).max_attempts(), 2);
    }

    #[test]
    fn test_template_values() {
        let args = TemplateArgs {
            vm_template: None,
            datasource_name: "fedora".into(),
            datasource_namespace: "images".into(),
            storage_size: "20Gi".into(),
            vm_memory: "4Gi".into(),
            vm_cpu_cores: 2,
        };
        let values = args.values("vm-a", Some("ceph-rbd"));
        assert_eq!(values.storage_class, "ceph-rbd");
        assert_eq!(values.vm_cpu_cores, 2);
        assert_eq!(args.values("vm-a", None).storage_class, "standard");
        assert_eq!(args.template().unwrap().name(), "builtin");
    }
}

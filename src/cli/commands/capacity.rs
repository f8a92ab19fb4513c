//! Capacity command - add VMs per iteration until the cluster is full

use super::{CommandContext, PollArgs, Runnable, TemplateArgs};
use crate::cli::parse_duration;
use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use virtbench::workload::capacity::{self, CapacitySettings};

/// Arguments for the capacity command
#[derive(Parser, Debug, Clone)]
pub struct CapacityArgs {
    #[command(flatten)]
    pub template: TemplateArgs,

    #[command(flatten)]
    pub poll: PollArgs,

    /// Namespace holding every capacity VM
    #[arg(short = 'n', long, default_value = "virt-capacity-benchmark")]
    pub namespace: String,

    /// VM name prefix; VMs are `{name}-{iteration}-{index}`
    #[arg(long, default_value = "rhel-9-vm")]
    pub vm_name: String,

    /// VMs created per iteration
    #[arg(long, default_value_t = 5)]
    pub vms: u32,

    /// Iteration cap (0 = until capacity is reached)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Storage classes, used round-robin across iterations
    #[arg(long, value_delimiter = ',')]
    pub storage_class: Vec<String>,

    /// Initial volume size, and the floor for resizes
    #[arg(long, default_value = "30Gi")]
    pub min_vol_size: String,

    /// Growth per resize
    #[arg(long, default_value = "10Gi")]
    pub min_vol_inc_size: String,

    /// Operations in flight per phase
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Pause between iterations
    #[arg(long, value_parser = parse_duration)]
    pub pause: Option<Duration>,

    /// Reuse an existing namespace
    #[arg(long)]
    pub skip_namespace_creation: bool,

    /// Skip the volume resize phase
    #[arg(long)]
    pub skip_resize_job: bool,

    /// Skip the VM restart phase
    #[arg(long)]
    pub skip_restart_job: bool,

    /// Skip the snapshot phase
    #[arg(long)]
    pub skip_snapshot_job: bool,

    /// Delete the namespace afterwards
    #[arg(long, conflicts_with = "cleanup_only")]
    pub cleanup: bool,

    /// Only delete the namespace; run nothing
    #[arg(long)]
    pub cleanup_only: bool,
}

impl CapacityArgs {
    pub fn settings(&self, ctx: &CommandContext) -> Result<CapacitySettings> {
        let defaults = CapacitySettings::default();
        let mut probe = ctx.config.probe_settings();
        if let Some(max) = self.max_iterations {
            probe.max_iterations = (max > 0).then_some(max);
        }
        if let Some(pause) = self.pause {
            probe.pause = pause;
        }

        let settings = CapacitySettings {
            scope: self.namespace.clone(),
            vm_name: self.vm_name.clone(),
            vms_per_iteration: self.vms,
            storage_classes: self.storage_class.clone(),
            min_volume_size: self.min_vol_size.clone(),
            volume_increment: self.min_vol_inc_size.clone(),
            concurrency: self
                .concurrency
                .unwrap_or_else(|| ctx.config.concurrency_or(defaults.concurrency)),
            template: self.template.template()?,
            values: self.template.values(
                &self.vm_name,
                self.storage_class.first().map(String::as_str),
            ),
            probe,
            skip_scope_creation: self.skip_namespace_creation,
            skip_resize: self.skip_resize_job,
            skip_restart: self.skip_restart_job,
            skip_snapshot: self.skip_snapshot_job,
            restart_leave_timeout: defaults.restart_leave_timeout,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[async_trait::async_trait]
impl Runnable for CapacityArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let settings = self.settings(ctx)?;
        let controller = ctx.controller().await?;
        let progress = ctx.progress("capacity");
        let workload = ctx.workload_context(controller, &progress, &self.poll);

        if self.cleanup_only {
            progress.finish();
            return Ok(ctx.cleanup_scopes(&workload, vec![settings.scope.clone()]).await);
        }

        let cap = settings
            .probe
            .max_iterations
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unbounded".into());
        ctx.output.banner(&format!(
            "Capacity probe: {} VMs per iteration in {} ({} iterations)",
            settings.vms_per_iteration, settings.scope, cap
        ));
        let skipped = settings.phases_skipped();
        if !skipped.is_empty() {
            ctx.output
                .info(&format!("Skipping phases: {}", skipped.join(", ")));
        }

        let report = capacity::run(&workload, &settings).await?;
        let writer = ctx.finish(&report.workload, &progress)?;
        let record = report.record();
        writer
            .write_json("iterations.json", &record)
            .context("Failed to write iteration records")?;

        if record.capacity_reached {
            ctx.output.info(&format!(
                "Capacity reached after {} iterations: {} VMs running, {} volumes",
                record.iterations_completed, record.total_vms, record.total_volumes
            ));
        } else {
            ctx.output.info(&format!(
                "Probe ended ({}) after {} iterations: {} VMs running, {} volumes",
                record.end_reason.as_str(),
                record.iterations_completed,
                record.total_vms,
                record.total_volumes
            ));
        }

        let mut code = report.workload.exit_code();
        if self.cleanup {
            let cleanup_code = ctx.cleanup_scopes(&workload, vec![settings.scope.clone()]).await;
            code = code.max(cleanup_code);
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::config::Config;
    use tokio_util::sync::CancellationToken;

    fn settings_for(args: &[&str], config: Config) -> Result<CapacitySettings> {
        let cli = Cli::try_parse_from(args).unwrap();
        let ctx = CommandContext::new(&cli, config, CancellationToken::new());
        match &cli.command {
            Commands::Capacity(args) => args.settings(&ctx),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let settings = settings_for(&["virtbench", "capacity"], Config::default()).unwrap();
        assert_eq!(settings.scope, "virt-capacity-benchmark");
        assert_eq!(settings.vms_per_iteration, 5);
        assert!(settings.probe.max_iterations.is_none());
        assert!(settings.phases_skipped().is_empty());
    }

    #[test]
    fn test_storage_classes_and_skips() {
        let settings = settings_for(
            &[
                "virtbench",
                "capacity",
                "--storage-class",
                "fast,slow",
                "--max-iterations",
                "4",
                "--skip-snapshot-job",
                "--skip-resize-job",
            ],
            Config::default(),
        )
        .unwrap();
        assert_eq!(settings.storage_classes, vec!["fast", "slow"]);
        assert_eq!(settings.storage_class_for(2), "slow");
        assert_eq!(settings.probe.max_iterations, Some(4));
        assert_eq!(settings.phases_skipped(), vec!["resize", "snapshot"]);
    }

    #[test]
    fn test_zero_iterations_means_unbounded() {
        let mut config = Config::default();
        config.capacity.max_iterations = 9;
        let settings = settings_for(&["virtbench", "capacity", "--max-iterations", "0"], config).unwrap();
        assert!(settings.probe.max_iterations.is_none());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(settings_for(&["virtbench", "capacity", "--min-vol-size", "lots"], Config::default()).is_err());
        assert!(settings_for(&["virtbench", "capacity", "--vms", "0"], Config::default()).is_err());
    }
}

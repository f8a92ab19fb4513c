//! Migration command - live-migrate VMs and time each migration

use super::{CommandContext, PollArgs, RangeArgs, Runnable, TemplateArgs};
use crate::cli::parse_duration;
use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use virtbench::controller::Location;
use virtbench::workload::creation::{self, CreationSettings};
use virtbench::workload::migration::{self, MigrationMode, MigrationWorkloadSettings};

/// Arguments for the migration command
#[derive(Parser, Debug, Clone)]
pub struct MigrationArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub template: TemplateArgs,

    #[command(flatten)]
    pub poll: PollArgs,

    /// Create the VMs before migrating them
    #[arg(long)]
    pub create_vms: bool,

    /// Storage class for VMs created with --create-vms
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Migrate in parallel (default: one at a time)
    #[arg(long, conflicts_with = "evacuate")]
    pub parallel: bool,

    /// Spread parallel migrations across source nodes
    #[arg(long, requires = "parallel")]
    pub interleave: bool,

    /// Migrate every VM off one node (--source-node, or the busiest node)
    #[arg(long)]
    pub evacuate: bool,

    /// Only migrate VMs running on this node; --create-vms pins VMs here
    #[arg(long)]
    pub source_node: Option<String>,

    /// Preferred destination node
    #[arg(long)]
    pub target_node: Option<String>,

    /// Migrations in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Time allowed for one migration
    #[arg(long, value_parser = parse_duration)]
    pub migration_timeout: Option<Duration>,

    /// Attempts per migration after a failed migration object
    #[arg(long)]
    pub max_migration_retries: Option<u32>,

    /// Delete the namespaces afterwards
    #[arg(long)]
    pub cleanup: bool,
}

impl MigrationArgs {
    pub fn mode(&self) -> MigrationMode {
        if self.evacuate {
            MigrationMode::Evacuate {
                source: self.source_node.clone().map(Location::new),
            }
        } else if self.parallel {
            MigrationMode::Parallel {
                interleave: self.interleave,
            }
        } else {
            MigrationMode::Sequential
        }
    }

    pub fn settings(&self, ctx: &CommandContext) -> Result<MigrationWorkloadSettings> {
        let mut settings = MigrationWorkloadSettings::new(self.range.target_range()?, self.mode());
        settings.concurrency = self
            .concurrency
            .unwrap_or_else(|| ctx.config.concurrency_or(settings.concurrency));
        settings.source_node = self.source_node.clone().map(Location::new);
        settings.target_node = self.target_node.clone().map(Location::new);

        settings.tracker = ctx.config.migration_settings();
        if let Some(timeout) = self.migration_timeout {
            settings.tracker.timeout = timeout;
        }
        if let Some(attempts) = self.max_migration_retries {
            settings.tracker.max_operation_attempts = attempts.max(1);
        }
        if let Some(interval) = self.poll.poll_interval {
            settings.tracker.poll_interval = interval;
        }
        Ok(settings)
    }

    fn creation_settings(&self, ctx: &CommandContext) -> Result<CreationSettings> {
        let mut settings = CreationSettings::new(self.range.target_range()?);
        settings.concurrency = ctx.config.concurrency_or(settings.concurrency);
        settings.scope_concurrency = ctx.config.defaults.scope_concurrency;
        settings.template = self.template.template()?;
        settings.values = self
            .template
            .values(&self.range.vm_name, self.storage_class.as_deref());
        if let Some(node) = &self.source_node {
            settings.single_node = true;
            settings.node_name = Some(node.clone());
        }
        Ok(settings)
    }
}

#[async_trait::async_trait]
impl Runnable for MigrationArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let settings = self.settings(ctx)?;
        let controller = ctx.controller().await?;
        let mut code = 0;

        if self.create_vms {
            let creation_settings = self.creation_settings(ctx)?;
            ctx.output.banner(&format!(
                "Creating {} VMs for migration",
                creation_settings.range.len()
            ));
            let progress = ctx.progress("creation");
            let workload = ctx.workload_context(controller.clone(), &progress, &self.poll);
            let report = creation::run(&workload, &creation_settings).await?;
            ctx.finish(&report, &progress)?;
            code = report.exit_code();
            if ctx.cancel.is_cancelled() {
                return Ok(code);
            }
        }

        ctx.output.banner(&format!(
            "VM migration ({}): {} VMs",
            settings.mode.as_str(),
            settings.range.len()
        ));
        let progress = ctx.progress("migration");
        let workload = ctx.workload_context(controller, &progress, &self.poll);
        let report = migration::run(&workload, &settings).await?;
        ctx.finish(&report, &progress)?;
        code = code.max(report.exit_code());

        if self.cleanup {
            let cleanup_code = ctx.cleanup_scopes(&workload, settings.range.scopes()).await;
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

    fn parse(args: &[&str]) -> Result<(Cli, MigrationArgs), clap::Error> {
        let cli = Cli::try_parse_from(args)?;
        match cli.command.clone() {
            Commands::Migration(args) => Ok((cli, args)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_modes() {
        let (_, args) = parse(&["virtbench", "migration"]).unwrap();
        assert_eq!(args.mode(), MigrationMode::Sequential);

        let (_, args) = parse(&["virtbench", "migration", "--parallel", "--interleave"]).unwrap();
        assert_eq!(args.mode(), MigrationMode::Parallel { interleave: true });

        let (_, args) = parse(&["virtbench", "migration", "--evacuate", "--source-node", "worker-1"]).unwrap();
        assert_eq!(
            args.mode(),
            MigrationMode::Evacuate {
                source: Some(Location::new("worker-1"))
            }
        );
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        assert!(parse(&["virtbench", "migration", "--parallel", "--evacuate"]).is_err());
        assert!(parse(&["virtbench", "migration", "--interleave"]).is_err());
    }

    #[test]
    fn test_tracker_settings_from_args() {
        let (cli, args) = parse(&[
            "virtbench",
            "migration",
            "--migration-timeout",
            "5m",
            "--max-migration-retries",
            "0",
            "--poll-interval",
            "2",
        ])
        .unwrap();
        let ctx = CommandContext::new(&cli, Config::default(), CancellationToken::new());
        let settings = args.settings(&ctx).unwrap();
        assert_eq!(settings.tracker.timeout, Duration::from_secs(300));
        assert_eq!(settings.tracker.max_operation_attempts, 1);
        assert_eq!(settings.tracker.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.concurrency, 10);
    }

    #[test]
    fn test_create_vms_pins_to_source_node() {
        let (cli, args) = parse(&["virtbench", "migration", "--create-vms", "--source-node", "worker-2"]).unwrap();
        let ctx = CommandContext::new(&cli, Config::default(), CancellationToken::new());
        let settings = args.creation_settings(&ctx).unwrap();
        assert!(settings.single_node);
        assert_eq!(settings.node_name.as_deref(), Some("worker-2"));
    }
}

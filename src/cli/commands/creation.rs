//! Creation command - create VMs and time them to Running

use super::{CommandContext, PollArgs, RangeArgs, Runnable, TemplateArgs};
use anyhow::Result;
use clap::Parser;

use virtbench::workload::creation::{self, CreationSettings};

/// Arguments for the creation command
#[derive(Parser, Debug, Clone)]
pub struct CreationArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub template: TemplateArgs,

    #[command(flatten)]
    pub poll: PollArgs,

    /// Storage class for the root disk
    #[arg(long)]
    pub storage_class: Option<String>,

    /// VMs created in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Reuse existing namespaces
    #[arg(long)]
    pub skip_namespace_creation: bool,

    /// Pin every VM to a single node
    #[arg(long)]
    pub single_node: bool,

    /// Node to pin to (defaults to the first worker with --single-node)
    #[arg(long)]
    pub node: Option<String>,

    /// Do not measure volume clone duration
    #[arg(long)]
    pub skip_clone_tracking: bool,

    /// Stop dispatching new VMs once one hits capacity exhaustion
    #[arg(long)]
    pub stop_on_exhaustion: bool,

    /// Afterwards stop every VM and start them all at once, timing each boot
    #[arg(long)]
    pub boot_storm: bool,

    /// Delete the namespaces afterwards
    #[arg(long)]
    pub cleanup: bool,
}

impl CreationArgs {
    pub fn settings(&self, ctx: &CommandContext) -> Result<CreationSettings> {
        let range = self.range.target_range()?;
        let mut settings = CreationSettings::new(range);
        settings.concurrency = self
            .concurrency
            .unwrap_or_else(|| ctx.config.concurrency_or(settings.concurrency));
        settings.scope_concurrency = ctx.config.defaults.scope_concurrency;
        settings.template = self.template.template()?;
        settings.values = self
            .template
            .values(&self.range.vm_name, self.storage_class.as_deref());
        settings.skip_scope_creation = self.skip_namespace_creation;
        settings.single_node = self.single_node;
        settings.node_name = self.node.clone();
        settings.track_clone = !self.skip_clone_tracking;
        settings.stop_on_exhaustion = self.stop_on_exhaustion;
        settings.boot_storm = self.boot_storm;
        Ok(settings)
    }
}

#[async_trait::async_trait]
impl Runnable for CreationArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let settings = self.settings(ctx)?;
        ctx.output.banner(&format!(
            "VM creation: {} VMs in {}-{}..{}",
            settings.range.len(),
            settings.range.prefix,
            settings.range.start,
            settings.range.end
        ));
        ctx.output.debug(&format!(
            "concurrency={} template={}",
            settings.concurrency,
            settings.template.name()
        ));

        let controller = ctx.controller().await?;
        let progress = ctx.progress("creation");
        let workload = ctx.workload_context(controller, &progress, &self.poll);

        let report = creation::run(&workload, &settings).await?;
        ctx.finish(&report, &progress)?;

        let mut code = report.exit_code();
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

    fn parse(args: &[&str]) -> (Cli, CreationArgs) {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command.clone() {
            Commands::Creation(args) => (cli, args),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_settings_from_args() {
        let (cli, args) = parse(&[
            "virtbench",
            "creation",
            "--start",
            "3",
            "--end",
            "6",
            "--storage-class",
            "ceph-rbd",
            "--concurrency",
            "4",
            "--single-node",
            "--stop-on-exhaustion",
            "--boot-storm",
        ]);
        let ctx = CommandContext::new(&cli, Config::default(), CancellationToken::new());
        let settings = args.settings(&ctx).unwrap();
        assert_eq!(settings.range.len(), 4);
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.values.storage_class, "ceph-rbd");
        assert!(settings.single_node);
        assert!(settings.stop_on_exhaustion);
        assert!(settings.track_clone);
        assert!(settings.boot_storm);
    }

    #[test]
    fn test_concurrency_falls_back_to_config() {
        let (cli, args) = parse(&["virtbench", "creation"]);
        let mut config = Config::default();
        config.defaults.concurrency = Some(7);
        let ctx = CommandContext::new(&cli, config, CancellationToken::new());
        assert_eq!(args.settings(&ctx).unwrap().concurrency, 7);

        let ctx = CommandContext::new(&cli, Config::default(), CancellationToken::new());
        assert_eq!(args.settings(&ctx).unwrap().concurrency, 50);
    }
}

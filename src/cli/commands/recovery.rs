//! Recovery command - time VM instances back into service after a node failure

use super::{CommandContext, PollArgs, RangeArgs, Runnable};
use anyhow::Result;
use clap::Parser;

use virtbench::controller::Location;
use virtbench::workload::recovery::{self, RecoverySettings};

/// Arguments for the recovery command
#[derive(Parser, Debug, Clone)]
pub struct RecoveryArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub poll: PollArgs,

    /// Instances monitored in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Node that was failed; uncordoned once every instance is back
    #[arg(long)]
    pub failed_node: Option<String>,
}

impl RecoveryArgs {
    pub fn settings(&self, ctx: &CommandContext) -> Result<RecoverySettings> {
        let mut settings = RecoverySettings::new(self.range.target_range()?);
        settings.concurrency = self
            .concurrency
            .unwrap_or_else(|| ctx.config.concurrency_or(settings.concurrency));
        settings.failed_node = self.failed_node.clone().map(Location::new);
        Ok(settings)
    }
}

#[async_trait::async_trait]
impl Runnable for RecoveryArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let settings = self.settings(ctx)?;
        ctx.output.banner(&format!(
            "Failure recovery: {} instances in {}-{}..{}",
            settings.range.len(),
            settings.range.prefix,
            settings.range.start,
            settings.range.end
        ));
        ctx.output
            .info("Trigger the node failure now if it has not happened yet");

        let controller = ctx.controller().await?;
        let progress = ctx.progress("recovery");
        let workload = ctx.workload_context(controller, &progress, &self.poll);

        let report = recovery::run(&workload, &settings).await?;
        ctx.finish(&report, &progress)?;
        Ok(report.exit_code())
    }
}

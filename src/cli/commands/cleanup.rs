//! Cleanup command - delete benchmark namespaces

use super::{CommandContext, PollArgs, RangeArgs, Runnable};
use anyhow::Result;
use clap::Parser;

use virtbench::workload::cleanup::delete_scopes;

/// Arguments for the cleanup command
#[derive(Parser, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Extra namespaces to delete, e.g. the capacity namespace
    #[arg(short = 'n', long = "namespace")]
    pub namespaces: Vec<String>,

    /// Only delete the namespaces given with --namespace
    #[arg(long, requires = "namespaces")]
    pub skip_range: bool,

    /// Namespaces deleted in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl CleanupArgs {
    pub fn scopes(&self) -> Result<Vec<String>> {
        let mut scopes = if self.skip_range {
            Vec::new()
        } else {
            self.range.target_range()?.scopes()
        };
        for namespace in &self.namespaces {
            if !scopes.contains(namespace) {
                scopes.push(namespace.clone());
            }
        }
        Ok(scopes)
    }
}

#[async_trait::async_trait]
impl Runnable for CleanupArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let scopes = self.scopes()?;
        let concurrency = self
            .concurrency
            .unwrap_or(ctx.config.defaults.cleanup_concurrency);
        ctx.output
            .banner(&format!("Cleanup: {} namespaces", scopes.len()));

        let controller = ctx.controller().await?;
        let progress = ctx.progress("cleanup");
        let workload = ctx.workload_context(controller, &progress, &PollArgs::default());

        let report = delete_scopes(&workload, scopes, concurrency).await;
        ctx.finish(&report, &progress)?;
        Ok(report.exit_code())
    }
}

//! virtbench - resource-lifecycle benchmarks for KubeVirt
//!
//! This is the main entry point for the virtbench CLI.

mod cli;
mod config;

use anyhow::Result;
use cli::commands::{CommandContext, Runnable};
use cli::{Cli, Commands};
use config::Config;
use tokio_util::sync::CancellationToken;
use virtbench::telemetry::{LogLevel, LoggingBuilder};

/// Exit code for configuration and argument errors
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load configuration: {:#}", e);
            std::process::exit(EXIT_USAGE);
        }
    };

    init_logging(&cli, &config);
    tracing::debug!(version = %virtbench::version_info(), "Starting");

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    // Create command context
    let mut ctx = CommandContext::new(&cli, config, cancel);

    // Execute the appropriate command
    let result = match &cli.command {
        Commands::Creation(args) => args.run(&mut ctx).await,
        Commands::Migration(args) => args.run(&mut ctx).await,
        Commands::Capacity(args) => args.run(&mut ctx).await,
        Commands::Recovery(args) => args.run(&mut ctx).await,
        Commands::Cleanup(args) => args.run(&mut ctx).await,
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            let code = exit_code_for(&e);
            if code == EXIT_USAGE {
                ctx.output.hint("check the arguments and configuration; see --help");
            }
            code
        }
    };

    ctx.output.flush();
    std::process::exit(exit_code);
}

/// Initialize logging from configuration, with `-v` flags taking over the level
fn init_logging(cli: &Cli, config: &Config) {
    let mut builder = LoggingBuilder::from_config(config.logging.clone())
        .with_target(cli.verbosity() >= 3)
        .with_ansi(!cli.no_color && config.logging.ansi_colors);

    if cli.verbosity() > 0 {
        builder = builder.with_level(LogLevel::from_verbosity(cli.verbosity()));
    }
    if let Some(path) = &cli.log_file {
        builder = builder.with_file_output(path);
    }

    if let Err(e) = builder.init() {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }
}

/// First Ctrl-C cancels the run; in-flight polls wind down and the partial
/// results are still written.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling outstanding work");
            cancel.cancel();
        }
    });
}

/// Process exit code for a command error
fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<virtbench::Error>())
        .map(virtbench::Error::exit_code)
        .unwrap_or(1)
}

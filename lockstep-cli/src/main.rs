//! Lockstep CLI - Command-line interface
//!
//! Runs demo co-simulations and hosts simulated engines as separate
//! processes.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use lockstep_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "A multi-rate co-simulation orchestrator")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, global = true, default_value = "info")]
    log_level: CliLogLevel,
    /// Directory for per-process debug logs
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(
        cli.log_level.as_tracing_level(),
        cli.logs_dir.as_deref(),
        cli.command.log_label(),
    )?;

    commands::handle_command(cli.command, cli.log_level, cli.logs_dir).await
}

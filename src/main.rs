//! Tessera - unified CLI entrypoint.
//!
//! Usage:
//!   tessera start --config config/tessera.toml
//!   tessera config validate --config config/tessera.toml
//!   tessera config show --config config/tessera.toml --format json
//!   tessera plan --kind increment --mode dist-sync --tx

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tessera::cli::commands::{init_tracing, run_config, run_plan, run_start_with_config};
use tessera::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/tessera.toml"));

    match cli.command {
        Commands::Start(args) => run_start_with_config(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
        Commands::Plan(args) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
            run_plan(args)
        }
    }
}

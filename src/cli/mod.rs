//! Command-line interface.
//!
//! Unified CLI for Tessera operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Tessera - transactional key-value cache with a command pipeline.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start every configured member in this process.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Show the load decision for a command.
    Plan(commands::PlanArgs),
}

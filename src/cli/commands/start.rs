//! Start command implementation.

use crate::core::config::{CacheMode, Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start every configured member in this process.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Override the node id from the config file.
    #[arg(long)]
    pub node_id: Option<String>,

    /// Override the cache mode from the config file.
    #[arg(long)]
    pub cache_mode: Option<CacheMode>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over `level` when set.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A second initialization (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}

/// Run the start command with the given config path.
pub async fn run_start_with_config(
    config_path: &Path,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        node_id: args.node_id,
        cache_mode: args.cache_mode,
    });

    init_tracing(&config.telemetry.log_level);

    let runtime = Runtime::new(config)?;
    runtime.run().await
}

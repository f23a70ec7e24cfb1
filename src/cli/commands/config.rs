//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/tessera.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/tessera.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("✓ Configuration is valid");
    println!("  node:    {}", config.node.node_id);
    println!("  mode:    {}", config.clustering.cache_mode);
    println!("  members: {}", config.node.members.len().max(1));
    if config.clustering.cache_mode.is_distributed() {
        println!("  owners:  {}", config.clustering.num_owners);
    }
    println!("  tx:      {}", config.transaction.enabled);
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("{}", render_config(&config, format)?);
    Ok(())
}

fn render_config(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        "toml" => Ok(toml::to_string_pretty(config)?),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = generate_template();
    match output {
        Some(path) => {
            std::fs::write(path, template)?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn generate_template() -> &'static str {
    r#"# Tessera Configuration

[node]
node_id = "node-1"
members = ["node-1", "node-2", "node-3"]

[clustering]
cache_mode = "dist-sync"
num_owners = 2
remote_timeout_ms = 15000
hash_seed = 0

[locking]
lock_acquisition_timeout_ms = 10000
concurrency_level = 32
isolation = "repeatable-read"

[transaction]
enabled = false
locking_mode = "optimistic"
write_skew_check = true

[invocation]
max_topology_retries = 3

[telemetry]
log_level = "info"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_is_a_valid_config() {
        let config = Config::from_toml(generate_template()).unwrap();
        assert_eq!(config.node.members.len(), 3);
        assert!(config.write_skew_enabled() || !config.transaction.enabled);
    }

    #[test]
    fn test_render_formats() {
        let config = Config::from_toml(generate_template()).unwrap();
        let json = render_config(&config, "json").unwrap();
        assert!(json.contains("\"cache_mode\": \"dist-sync\""));

        let toml = render_config(&config, "toml").unwrap();
        let reparsed = Config::from_toml(&toml).unwrap();
        assert_eq!(reparsed.clustering.num_owners, 2);

        assert!(render_config(&config, "yaml").is_err());
    }
}

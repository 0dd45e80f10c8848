//! Prints the effective engine configuration.

use anyhow::{Context, Result};
use clap::Args;
use pairquote_engine::{ConfigLoader, EngineConfig};

/// Arguments for the check-config command.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml", env = "PAIRQUOTE_CONFIG")]
    pub config: String,

    /// Profile overlay (loads Config.<profile>.toml from the same directory)
    #[arg(short, long)]
    pub profile: Option<String>,
}

/// Loads configuration from a file path, optionally with a profile overlay.
pub fn load_config(path: &str, profile: Option<&str>) -> Result<EngineConfig> {
    match profile {
        Some(profile) => ConfigLoader::load_with_profile(path, profile)
            .with_context(|| format!("Failed to load {path} with profile {profile}")),
        None => ConfigLoader::load(path).with_context(|| format!("Failed to load {path}")),
    }
}

/// Runs the check-config command.
pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = load_config(&args.config, args.profile.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

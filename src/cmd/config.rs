//! Configuration view and validation commands: `trilha config`.

use std::path::Path;

use anyhow::{Context, Result};
use trilha::config::TrilhaConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &TrilhaConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Trilha Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; showing defaults", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                anyhow::bail!("{} configuration problem(s) found", warnings.len());
            }
        }
    }
    Ok(())
}

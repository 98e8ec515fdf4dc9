//! Configuration view and validation commands: `studio config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use brand_studio::config::StudioConfig;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = StudioConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Brand Studio Configuration");
            println!("==========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No studio.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}

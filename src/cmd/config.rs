//! Configuration view and validation commands (`mender config`).

use anyhow::{Result, bail};

use mender::mender_config::{CONFIG_FILE, MenderConfig, MenderToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = MenderConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Mender Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            let settings = config.toml.review_settings();
            println!(
                "Iteration limit: {} ({} profile)",
                settings.effective_max_iterations(),
                settings.profile
            );
            match config.toml.agent.agent_command() {
                Some(command) => println!("Agent: {}", command.program),
                None => println!("Agent: none (built-in collaborators only)"),
            }
            println!();
            if !config_path.exists() {
                println!("Run 'mender config init' to create a {CONFIG_FILE} file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let problems = config.validate();
            if problems.is_empty() {
                if config_path.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No {CONFIG_FILE} found. Using defaults (valid).");
                }
                println!();
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                bail!("{} configuration problem(s) found", problems.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            MenderToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [review] max_iterations, profile, completion_mode");
            println!("  - [document] required_fields, required_sections, type_names");
            println!("  - [agent] command and the roles it takes over");
            println!();
        }
    }

    Ok(())
}

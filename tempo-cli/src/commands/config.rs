use crate::config::SettingsLoader;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective settings and the params they produce
    Show {
        /// Settings file (default: .tempo/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show the project settings path
    Path,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { config } => show_config(config),
        ConfigCommands::Path => show_path(),
    }
}

fn show_config(config: Option<PathBuf>) -> Result<()> {
    let settings = SettingsLoader::load(config.as_deref())?;
    let toml_str = toml::to_string_pretty(&settings)?;
    println!("{}", toml_str);

    match settings.consuming_params() {
        Ok(params) => println!("# {}", params),
        Err(e) => println!("# invalid: {}", e),
    }
    Ok(())
}

fn show_path() -> Result<()> {
    println!("Project config: {:?}", SettingsLoader::project_config_path());
    Ok(())
}

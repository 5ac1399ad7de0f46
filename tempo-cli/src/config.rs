use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tempo_consumer::ConsumerSettings;

pub struct SettingsLoader;

/// Values given on the command line, applied over the settings file.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub from: Option<String>,
    pub to: Option<String>,
    pub rate: Option<f64>,
}

impl SettingsLoader {
    /// Load settings from `path`, or from the project config when no path is
    /// given. A missing project config yields defaults.
    pub fn load(path: Option<&Path>) -> Result<ConsumerSettings> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            return ConsumerSettings::load(path)
                .with_context(|| format!("Failed to load {}", path.display()));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            return ConsumerSettings::load(&project_path)
                .with_context(|| format!("Failed to load {}", project_path.display()));
        }
        Ok(ConsumerSettings::default())
    }

    /// Get project config path
    /// Can be overridden with TEMPO_PROJECT_CONFIG_DIR env var
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("TEMPO_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".tempo/config.toml")
        }
    }

    /// Apply command line values; each one replaces the file value.
    pub fn apply(mut settings: ConsumerSettings, overrides: SettingsOverrides) -> ConsumerSettings {
        if let Some(from) = overrides.from {
            settings.from = Some(from);
        }
        if let Some(to) = overrides.to {
            settings.to = Some(to);
        }
        if let Some(rate) = overrides.rate {
            settings.rate = rate;
        }
        settings
    }
}

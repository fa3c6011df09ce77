use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::calendar::CalendarConfig;
use crate::coordinator::{BudgetConfig, CoordinatorConfig};
use crate::executors::CommandSpec;
use crate::pipeline::{RetryConfig, StepTable};

pub const DEFAULT_CONFIG_FILE: &str = "yard-migrator.toml";
pub const ENV_PREFIX: &str = "YARD_MIGRATOR";

/// Main configuration structure for the migrator
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Where item records live
    pub store: StoreConfig,
    /// Attempt ceilings and backoff
    pub retry: RetryConfig,
    /// Dispatch limits, timeouts and run loop timing
    pub coordinator: CoordinatorConfig,
    /// Daily upload allowance
    pub budget: BudgetConfig,
    /// Publication slots
    pub calendar: CalendarConfig,
    /// External program per step; schedule and publish fall back to built-ins
    pub executors: StepTable<Option<CommandSpec>>,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".yard-migrator/state"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or `EnvFilter` directive
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `path`, or `yard-migrator.toml` in the working directory if present
    /// 3. Environment variables (`YARD_MIGRATOR__RETRY__BASE_DELAY_SECS=60`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&MigrationConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to read configuration")?;
        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Step;

    #[test]
    fn defaults_follow_the_migration_plan() {
        let config = MigrationConfig::default();
        assert_eq!(config.retry.max_attempts.get(Step::Download), &Some(3));
        assert_eq!(config.retry.max_attempts.get(Step::Convert), &Some(2));
        assert_eq!(config.coordinator.concurrency.download, 3);
        assert_eq!(config.budget.uploads_per_day, Some(5));
        assert!(config.executors.download.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrator.toml");
        std::fs::write(
            &path,
            r#"
[retry]
base_delay_secs = 60

[coordinator.concurrency]
download = 8
convert = 2
upload = 1
schedule = 1
publish = 1

[executors.download]
program = "fetch-episode"
args = ["--quiet"]
"#,
        )
        .unwrap();

        let config = MigrationConfig::load(Some(&path)).unwrap();
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.retry.max_delay_secs, 3600);
        assert_eq!(config.coordinator.concurrency.download, 8);
        let download = config.executors.download.unwrap();
        assert_eq!(download.program, "fetch-episode");
        assert_eq!(download.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = MigrationConfig::default();
        config.store.path = PathBuf::from("/srv/migration/state");
        config.save_to_file(&path).unwrap();

        let loaded = MigrationConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.store.path, PathBuf::from("/srv/migration/state"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(MigrationConfig::load(Some(Path::new("/nonexistent/yard.toml"))).is_err());
    }
}

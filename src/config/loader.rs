use super::types::ManagerConfig;
use crate::framework::FrameworkVersion;
use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use std::path::{Component, Path};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    /// Load configuration from `NUGGET_` environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<ManagerConfig> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&ManagerConfig::default())
                .context("Failed to serialize default configuration")?,
        );

        if let Some(config_path) = &self.config_file {
            builder = builder.add_source(File::with_name(config_path).required(false));
        } else {
            builder = builder
                .add_source(File::with_name("nugget-rs").required(false))
                .add_source(File::with_name("config/nugget-rs").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("NUGGET")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let config: ManagerConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate(&config)?;
        Ok(config)
    }
}

/// Reject settings the lifecycle manager cannot work with
pub fn validate(config: &ManagerConfig) -> Result<()> {
    ensure!(
        FrameworkVersion::parse(&config.runtime_framework).is_some(),
        "runtime_framework '{}' carries no version",
        config.runtime_framework
    );
    ensure!(
        !config.scratch_root.as_os_str().is_empty(),
        "scratch_root must not be empty"
    );
    ensure!(
        !config
            .scratch_root
            .components()
            .any(|c| c == Component::ParentDir),
        "scratch_root {:?} must not contain '..'",
        config.scratch_root
    );

    let binaries_root = Path::new(&config.binaries_root);
    ensure!(
        !config.binaries_root.is_empty()
            && binaries_root
                .components()
                .all(|c| matches!(c, Component::Normal(_))),
        "binaries_root '{}' must be a relative path inside the package",
        config.binaries_root
    );

    ensure!(
        config.cleanup.max_attempts >= 1,
        "cleanup.max_attempts must be at least 1"
    );
    ensure!(
        config.event_capacity >= 1,
        "event_capacity must be at least 1"
    );
    Ok(())
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

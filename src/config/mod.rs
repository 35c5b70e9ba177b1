//! Configuration management for nestscan
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use nestscan::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Broker: {}", config.broker.url);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `NESTSCAN__<section>__<key>`
//!
//! Examples:
//! - `NESTSCAN__BROKER__URL=amqp://rabbit:5672/%2f`
//! - `NESTSCAN__MODEL__WIDTH=5`
//! - `NESTSCAN__MODEL__SPOOL_THRESHOLD=16MB`
//!
//! Broker credentials come only from `NESTSCAN_BROKER_USER` and
//! `NESTSCAN_BROKER_PASSWORD`.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/nestscan.toml`.
//! This can be overridden using the `NESTSCAN_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    BrokerConfig, Config, ModelConfig, OutboxConfig, SubprocessConfig, TelemetryConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Render as TOML in the file format accepted by [`Config::load_from_path`].
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");
        fs::write(&config_path, "[model]\nwidth = 2\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.model.width, 2);
        assert_eq!(config.model.max_depth, 8);
    }

    #[test]
    fn test_rendered_config_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("rendered.toml");

        let mut config = Config::default();
        config.model.width = 7;
        config.queues.matches = "results".to_string();
        config.broker.password = Some("hunter2".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("hunter2"));

        fs::write(&config_path, rendered).unwrap();
        let loaded = Config::load_from_path(config_path).unwrap();
        assert_eq!(loaded.model.width, 7);
        assert_eq!(loaded.queues, config.queues);
        assert_eq!(loaded.model.spool_threshold, config.model.spool_threshold);
    }

    #[test]
    fn test_validation_runs_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");
        fs::write(&config_path, "[model]\nmax_depth = 0\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::InvalidMaxDepth)
        ));
    }
}

pub mod path;


use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::collections::processor::ButtonThresholds;

/// Represents all possible errors loading a [Config]
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Could not read: {0}")]
    IoError(#[from] io::Error),
    #[error("Unable to deserialize: {0}")]
    DeserializeError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration loaded from YAML
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub button: ButtonConfig,
    pub fastpath: FastPathConfig,
}

/// Default thresholds applied to button processors
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct ButtonConfig {
    pub press_threshold: f64,
    pub release_threshold: f64,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            press_threshold: 0.5,
            release_threshold: 0.4,
        }
    }
}

impl ButtonConfig {
    pub fn thresholds(&self) -> ButtonThresholds {
        ButtonThresholds {
            press: self.press_threshold,
            release: self.release_threshold,
        }
    }
}

/// Fast-path queue and timer tunables
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct FastPathConfig {
    /// Number of entries in each fast-path queue
    pub queue_entries: usize,
    /// Period of the LED actuator poll timer in microseconds
    pub led_refresh_interval_us: u64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            queue_entries: 128,
            led_refresh_interval_us: 7500,
        }
    }
}

impl FastPathConfig {
    pub fn led_refresh_interval(&self) -> Duration {
        Duration::from_micros(self.led_refresh_interval_us)
    }
}

impl Config {
    /// Load a [Config] from the given YAML string
    pub fn from_yaml(content: &str) -> Result<Config, LoadError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a [Config] from the given YAML file
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Config, LoadError> {
        let file = std::fs::File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from the first config file found in the search
    /// paths, falling back to defaults when none exists or loading fails.
    pub fn load() -> Config {
        for path in path::get_config_paths() {
            if !path.exists() {
                continue;
            }
            match Config::from_yaml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded configuration from {path:?}");
                    return config;
                }
                Err(err) => {
                    log::warn!("Unable to load configuration from {path:?}: {err}");
                }
            }
        }
        log::debug!("No configuration found. Using defaults.");
        Config::default()
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.button.release_threshold > self.button.press_threshold {
            return Err(LoadError::Invalid(format!(
                "button release threshold ({}) exceeds press threshold ({})",
                self.button.release_threshold, self.button.press_threshold
            )));
        }
        if self.fastpath.queue_entries == 0 {
            return Err(LoadError::Invalid(
                "fastpath queue_entries must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

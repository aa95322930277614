//! Application configuration.
//!
//! Loaded once at startup from a YAML file. Routing settings themselves
//! are not configuration; they live in the settings store and are
//! hot-reloaded from there.

use crate::error::{ProxyError, Result};
use crate::store::StorageArea;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Locations searched when no configuration path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "./proxy-router.yaml",
    "./proxy-router.yml",
    "/etc/proxy-router/config.yaml",
];

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Settings store section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON settings document.
    pub path: PathBuf,

    /// Area the router reads its settings from.
    pub area: StorageArea,

    /// Quiet period before an edited settings file is re-read, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./proxy-settings.json"),
            area: StorageArea::Local,
            debounce_ms: 500,
        }
    }
}

impl StoreConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stderr".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        // An empty file is a valid, all-defaults configuration.
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?
        };

        config.validate()?;

        Ok(config)
    }

    /// Loads `path` if given, else the first existing default location,
    /// else the built-in defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match DEFAULT_CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.path.as_os_str().is_empty() {
            return Err(ProxyError::config_validation(
                "Store path cannot be empty",
            ));
        }

        if self.store.debounce_ms == 0 {
            return Err(ProxyError::config_validation(
                "Store debounce_ms must be greater than zero",
            ));
        }

        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, VALID_LEVELS
            )));
        }

        Ok(())
    }
}

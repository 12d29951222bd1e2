//! Configuration system for the bounded executor
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. Environment variables (BOUNDED_EXECUTOR_* prefix)
//! 2. Configuration file (TOML)
//! 3. Default values

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Executor sizing and identity
    pub executor: ExecutorSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Name used in log fields to tell executors apart
    pub name: String,

    /// Maximum number of concurrently running handlers.
    ///
    /// Read once, when the first task is submitted.
    pub capacity: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            name: "task-executor".to_string(),
            capacity: num_cpus::get(),
        }
    }
}

impl ExecutorSettings {
    /// Settings with the default name and the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ConfigNotFound {
                path: path.to_path_buf(),
                source: Some(e),
            },
            _ => Error::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("bounded-executor.toml"),
            dirs::config_dir()
                .map(|p| p.join("bounded-executor").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if path.is_file() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BOUNDED_EXECUTOR_NAME") {
            self.executor.name = val;
        }
        if let Ok(val) = std::env::var("BOUNDED_EXECUTOR_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.executor.capacity = n;
            }
        }

        if let Ok(val) = std::env::var("BOUNDED_EXECUTOR_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("BOUNDED_EXECUTOR_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("BOUNDED_EXECUTOR_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and environment variables in paths
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.executor.name.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "executor.name",
                "Executor name cannot be empty",
            ));
        }

        // A zero-sized gate never runs anything; only the programmatic
        // constructor is allowed to build one.
        if self.executor.capacity == 0 {
            return Err(Error::config_field_invalid(
                "executor.capacity",
                "capacity must be at least 1",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default configuration file content with comments
pub fn default_config_toml() -> String {
    format!(
        r#"# Bounded executor configuration

[executor]
# Name used in log fields
name = "task-executor"

# Maximum number of concurrently running handlers.
# Read once, when the first task is submitted; later changes do not resize the gate.
capacity = {}

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.bounded-executor/logs/executor.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#,
        num_cpus::get()
    )
}

//! Configuration management
//!
//! This module handles loading, validation, and management of the Cadence
//! configuration. Configuration is stored in TOML format at
//! ~/.cadence/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory, log level
//! - **backend**: Step backend endpoint and model
//! - **executor**: Concurrency ceiling, forwarded-context budget, retry
//! - **persistence**: Task history database
//!
//! # Path Expansion
//!
//! The configuration system automatically expands `~` to the user's home
//! directory and creates the data directory if it doesn't exist.

use sdk::errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Represents the complete Cadence configuration loaded from
/// ~/.cadence/config.toml. Every field has a serde default so a partial
/// file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Step backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Persistence configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Step backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL for the step backend API
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,

    /// Model name handed to the backend
    #[serde(default = "default_backend_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of steps running concurrently (clamped to 1..=16)
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Forwarded-context budget in characters
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,

    /// Retry transient backend failures once per step
    #[serde(default = "default_true")]
    pub retry_transient: bool,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Enable task history persistence
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Database file name, resolved under the data directory
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.cadence/data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_backend_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_backend_timeout() -> u64 {
    300
}

fn default_max_concurrent_steps() -> usize {
    4
}

fn default_context_budget() -> usize {
    2000
}

fn default_db_file() -> String {
    "tasks.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            model: default_backend_model(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            context_budget: default_context_budget(),
            retry_transient: true,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_file: default_db_file(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            backend: BackendConfig::default(),
            executor: ExecutorConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration file path: ~/.cadence/config.toml
    pub fn default_path() -> Result<PathBuf, OrchestratorError> {
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".cadence").join("config.toml"))
    }

    /// Load configuration from the default location, creating a default
    /// file if none exists.
    pub fn load_or_create() -> Result<Self, OrchestratorError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            let config = Config::default();
            config.save_to_path(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, OrchestratorError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| OrchestratorError::Config(format!("Invalid TOML: {}", e)))?;

        config.expand_and_validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<(), OrchestratorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Config(format!("Cannot serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Resolved database path under the data directory
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join(&self.persistence.db_file)
    }

    /// Expand `~` in paths, clamp limits, and validate values
    fn expand_and_validate(&mut self) -> Result<(), OrchestratorError> {
        self.core.data_dir = expand_tilde(&self.core.data_dir)?;

        match self.core.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(OrchestratorError::Config(format!(
                    "Unknown log level: {}",
                    other
                )))
            }
        }

        // Concurrency ceiling bounds backend load
        self.executor.max_concurrent_steps = self.executor.max_concurrent_steps.clamp(1, 16);

        if self.executor.context_budget == 0 {
            return Err(OrchestratorError::Config(
                "executor.context_budget must be greater than zero".into(),
            ));
        }

        if self.backend.base_url.is_empty() {
            return Err(OrchestratorError::Config(
                "backend.base_url must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory
fn expand_tilde(path: &Path) -> Result<PathBuf, OrchestratorError> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        config.expand_and_validate().unwrap();
        assert_eq!(config.executor.max_concurrent_steps, 4);
        assert_eq!(config.executor.context_budget, 2000);
        assert!(config.persistence.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
[executor]
max_concurrent_steps = 2
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.max_concurrent_steps, 2);
        assert_eq!(config.executor.context_budget, 2000);
        assert_eq!(config.backend.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let toml_str = r#"
[executor]
max_concurrent_steps = 64
"#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        config.expand_and_validate().unwrap();
        assert_eq!(config.executor.max_concurrent_steps, 16);

        let toml_str = r#"
[executor]
max_concurrent_steps = 0
"#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        config.expand_and_validate().unwrap();
        assert_eq!(config.executor.max_concurrent_steps, 1);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let toml_str = r#"
[core]
data_dir = "/tmp/cadence"
log_level = "verbose"
"#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.expand_and_validate().is_err());
    }

    #[test]
    fn test_zero_context_budget_rejected() {
        let toml_str = r#"
[executor]
context_budget = 0
"#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.expand_and_validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.core.data_dir = dir.path().join("data");
        config.executor.context_budget = 4096;
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.executor.context_budget, 4096);
        assert_eq!(loaded.core.data_dir, dir.path().join("data"));
    }

    #[test]
    fn test_db_path_joins_data_dir() {
        let mut config = Config::default();
        config.core.data_dir = PathBuf::from("/var/lib/cadence");
        assert_eq!(
            config.db_path(),
            PathBuf::from("/var/lib/cadence/tasks.db")
        );
    }
}

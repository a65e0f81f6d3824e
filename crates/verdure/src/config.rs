//! Hub configuration
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! clock = "virtual"
//! default_pool_size = 10
//! default_max_workers = 1000
//! max_idle_sleep_ms = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors that can occur while loading a [`HubConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid TOML or has unknown fields
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where the hub takes its time from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Wall-clock monotonic time; idle periods sleep the OS thread
    #[default]
    Monotonic,
    /// Simulated time that jumps to the next timer when nothing is runnable
    Virtual,
}

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Clock driving timers and sleeps
    pub clock: ClockMode,

    /// Concurrency limit used by `ThreadGroup::from_config`
    pub default_pool_size: usize,

    /// Worker limit used by `GreenThreadPoolExecutor::from_config`
    pub default_max_workers: usize,

    /// Longest single OS sleep while idle on the monotonic clock
    pub max_idle_sleep_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Monotonic,
            default_pool_size: 10,
            default_max_workers: 1000,
            max_idle_sleep_ms: 50,
        }
    }
}

impl HubConfig {
    /// Default configuration on the virtual clock
    pub fn virtual_clock() -> Self {
        Self {
            clock: ClockMode::Virtual,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "default_pool_size must be at least 1".to_string(),
            ));
        }
        if self.default_max_workers == 0 {
            return Err(ConfigError::Invalid(
                "default_max_workers must be at least 1".to_string(),
            ));
        }
        if self.max_idle_sleep_ms == 0 {
            return Err(ConfigError::Invalid(
                "max_idle_sleep_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.default_pool_size, 10);
        assert_eq!(config.default_max_workers, 1000);
    }

    #[test]
    fn test_partial_document() {
        let config = HubConfig::from_toml_str("clock = \"virtual\"\ndefault_pool_size = 4\n").unwrap();
        assert_eq!(config.clock, ClockMode::Virtual);
        assert_eq!(config.default_pool_size, 4);
        assert_eq!(config.max_idle_sleep_ms, 50);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = HubConfig::from_toml_str("workers = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let err = HubConfig::from_toml_str("default_pool_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "clock = \"virtual\"").unwrap();
        writeln!(file, "default_max_workers = 8").unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.clock, ClockMode::Virtual);
        assert_eq!(config.default_max_workers, 8);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HubConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

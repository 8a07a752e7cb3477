//! Watcher and registry configuration.
//!
//! Validated at load time, with humantime durations in TOML form
//! (`wait_period = "250ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Default pause granted to an attaching debugger after a fork.
pub const DEFAULT_DEBUGGER_ATTACH_DELAY: Duration = Duration::from_secs(3);

/// Configuration for one watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Watcher name (must be a valid identifier).
    pub name: String,

    /// Duration between polling ticks. Must be positive.
    #[serde(with = "humantime_serde")]
    pub wait_period: Duration,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl WatcherConfig {
    /// Creates a configuration with the required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, wait_period: Duration) -> Self {
        Self {
            name: name.into(),
            wait_period,
            description: String::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the name is empty or malformed, or the wait
    /// period is zero.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WatcherError::config("name cannot be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WatcherError::config(
                "name must contain only alphanumeric characters, hyphens, and underscores",
            ));
        }
        if self.wait_period.is_zero() {
            return Err(WatcherError::config("wait_period must be positive"));
        }
        Ok(())
    }

    /// Loads a configuration from a TOML file and validates it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| WatcherError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for the watcher registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Launch the fleet inside one shared forked worker process.
    #[serde(default)]
    pub execute_in_subprocess: bool,

    /// Block `launch` until the worker signals it is up.
    #[serde(default)]
    pub wait_for_subprocess: bool,

    /// Pause granted to an attaching debugger in the freshly forked
    /// worker, applied only when the parent is being traced at fork time.
    #[serde(default = "default_debugger_attach_delay")]
    #[serde(with = "humantime_serde")]
    pub debugger_attach_delay: Duration,
}

fn default_debugger_attach_delay() -> Duration {
    DEFAULT_DEBUGGER_ATTACH_DELAY
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            execute_in_subprocess: false,
            wait_for_subprocess: false,
            debugger_attach_delay: DEFAULT_DEBUGGER_ATTACH_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = WatcherConfig::new("usage-poller", Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = WatcherConfig::new("", Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_name_rejected() {
        let config = WatcherConfig::new("usage poller!", Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_wait_period_rejected() {
        let config = WatcherConfig::new("poller", Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wait_period"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = WatcherConfig::new("poller", Duration::from_millis(250))
            .with_description("resource usage poller");
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("250ms"));
        let parsed: WatcherConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.wait_period, Duration::from_millis(250));
        assert_eq!(parsed.description, "resource usage poller");
    }

    #[test]
    fn test_registry_config_defaults() {
        let config: RegistryConfig = toml::from_str("").unwrap();
        assert!(!config.execute_in_subprocess);
        assert!(!config.wait_for_subprocess);
        assert_eq!(config.debugger_attach_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_registry_config_parse() {
        let config: RegistryConfig = toml::from_str(
            "execute_in_subprocess = true\nwait_for_subprocess = true\ndebugger_attach_delay = \"1s\"\n",
        )
        .unwrap();
        assert!(config.execute_in_subprocess);
        assert!(config.wait_for_subprocess);
        assert_eq!(config.debugger_attach_delay, Duration::from_secs(1));
    }
}

//! Configuration management for devlaunch.
//!
//! This module defines the structure of the optional `devlaunch.toml` file and
//! the `SupervisorPolicy` it feeds: timeouts and retry counts for the install and
//! lifecycle workflows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "devlaunch.toml";

pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INSTALL_ATTEMPTS: u32 = 3;
pub const DEFAULT_INSTALL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_CEILING: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 50;

/// Top-level configuration structure corresponding to `devlaunch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Hard timeout for one dependency install attempt (seconds).
    pub install_timeout_secs: Option<u64>,
    /// Maximum number of install attempts.
    pub install_attempts: Option<u32>,
    /// Base backoff between install attempts, multiplied by the attempt number (milliseconds).
    pub install_backoff_ms: Option<u64>,
    /// Silence window after which a live process counts as running (seconds).
    pub startup_timeout_secs: Option<u64>,
    /// Upper bound on waiting for exit after a stop before cleaning up (seconds).
    pub stop_ceiling_secs: Option<u64>,
    /// How many projects the history keeps.
    pub max_history_entries: Option<usize>,
    /// Override for the history file location.
    pub history_file: Option<PathBuf>,
}

/// Timing and retry policy for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub install_timeout: Duration,
    pub install_attempts: u32,
    pub install_backoff: Duration,
    pub startup_timeout: Duration,
    pub stop_ceiling: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            install_attempts: DEFAULT_INSTALL_ATTEMPTS,
            install_backoff: DEFAULT_INSTALL_BACKOFF,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_ceiling: DEFAULT_STOP_CEILING,
        }
    }
}

impl Config {
    /// Policy with every unset field left at its default.
    pub fn policy(&self) -> SupervisorPolicy {
        let defaults = SupervisorPolicy::default();
        SupervisorPolicy {
            install_timeout: self
                .install_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.install_timeout),
            install_attempts: self
                .install_attempts
                .unwrap_or(defaults.install_attempts)
                .max(1),
            install_backoff: self
                .install_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.install_backoff),
            startup_timeout: self
                .startup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
            stop_ceiling: self
                .stop_ceiling_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_ceiling),
        }
    }

    pub fn max_history_entries(&self) -> usize {
        self.max_history_entries
            .unwrap_or(DEFAULT_MAX_HISTORY_ENTRIES)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `devlaunch.toml` in the current directory, if present.
pub fn default_config_path() -> Option<PathBuf> {
    let path = std::env::current_dir().ok()?.join(CONFIG_FILE);
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
install_timeout_secs = 120
install_attempts = 5
install_backoff_ms = 250
startup_timeout_secs = 4
stop_ceiling_secs = 12
max_history_entries = 10
history_file = "/var/lib/devlaunch/history.json"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let policy = config.policy();
        assert_eq!(policy.install_timeout, Duration::from_secs(120));
        assert_eq!(policy.install_attempts, 5);
        assert_eq!(policy.install_backoff, Duration::from_millis(250));
        assert_eq!(policy.startup_timeout, Duration::from_secs(4));
        assert_eq!(policy.stop_ceiling, Duration::from_secs(12));
        assert_eq!(config.max_history_entries(), 10);
        assert_eq!(
            config.history_file.as_deref(),
            Some(Path::new("/var/lib/devlaunch/history.json"))
        );
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.policy(), SupervisorPolicy::default());
        assert_eq!(config.max_history_entries(), DEFAULT_MAX_HISTORY_ENTRIES);
    }

    #[test]
    fn zero_attempts_is_clamped() {
        let config = Config {
            install_attempts: Some(0),
            ..Config::default()
        };
        assert_eq!(config.policy().install_attempts, 1);
    }

    #[test]
    fn load_config_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "install_attempts = \"many\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}

// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

pub const CALL_TIMEOUT_VAR: &str = "PLUGIN_HOST_CALL_TIMEOUT_MS";
pub const LOG_LEVEL_VAR: &str = "PLUGIN_HOST_LOG_LEVEL";
pub const LOG_DIR_VAR: &str = "PLUGIN_HOST_LOG_DIR";

const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive number of milliseconds, got `{value}`")]
    InvalidTimeout { var: &'static str, value: String },
}

/// Settings shared by every connection the host opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Applied to every outer and nested call.
    pub call_timeout: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_dir: None,
        }
    }
}

impl HostConfig {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded .env from {}", path.display());
        }
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = get(CALL_TIMEOUT_VAR) {
            let ms = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| ConfigError::InvalidTimeout { var: CALL_TIMEOUT_VAR, value: raw.clone() })?;
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = get(LOG_LEVEL_VAR).filter(|l| !l.trim().is_empty()) {
            config.log_level = level.trim().to_string();
        }
        if let Some(dir) = get(LOG_DIR_VAR).filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = HostConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn reads_all_values() {
        let config = HostConfig::from_vars(vars(&[
            (CALL_TIMEOUT_VAR, "250"),
            (LOG_LEVEL_VAR, "debug"),
            (LOG_DIR_VAR, "/var/log/plugins"),
        ]))
        .unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/plugins")));
    }

    #[test]
    fn bad_timeout_is_an_error() {
        for bad in ["soon", "-5", "0", ""] {
            let err = HostConfig::from_vars(vars(&[(CALL_TIMEOUT_VAR, bad)])).unwrap_err();
            assert_eq!(err, ConfigError::InvalidTimeout { var: CALL_TIMEOUT_VAR, value: bad.to_string() });
        }
    }
}

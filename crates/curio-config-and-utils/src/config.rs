//! Configuration for the delivery core.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default ingestion endpoint (can be overridden at compile time via CURIO_SERVER_URL).
pub const DEFAULT_SERVER_URL: &str = match option_env!("CURIO_SERVER_URL") {
    Some(url) => url,
    None => "https://curio.example.com/api/v2",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_SESSION_TIMEOUT_MINUTES: u32 = 30;
const DEFAULT_DISPATCH_PERIOD_MINUTES: u32 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_UNAUTHORIZED_RETRIES: u32 = 5;

/// SDK configuration. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingestion endpoint base URL; route suffixes are appended to it.
    pub server_url: String,
    pub api_key: String,
    pub tracking_code: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub session_timeout_minutes: u32,
    /// Defer non-session requests into the periodic store.
    pub periodic_dispatch_enabled: bool,
    pub dispatch_period_minutes: u32,
    pub auto_push_registration: bool,
    pub request_timeout_secs: u64,
    pub max_unauthorized_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: String::new(),
            tracking_code: String::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
            periodic_dispatch_enabled: false,
            dispatch_period_minutes: DEFAULT_DISPATCH_PERIOD_MINUTES,
            auto_push_registration: false,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_unauthorized_retries: DEFAULT_MAX_UNAUTHORIZED_RETRIES,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config.normalize();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.normalize();

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `CURIO_*` overrides from an arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("CURIO_LOG_LEVEL").and_then(non_empty) {
            self.log_level = level;
        }
        if let Some(url) = lookup("CURIO_SERVER_URL").and_then(non_empty) {
            self.server_url = url;
        }
        if let Some(flag) = lookup("CURIO_PERIODIC_DISPATCH").and_then(non_empty) {
            self.periodic_dispatch_enabled =
                matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes");
        }
    }

    /// Clamp values that would break session bookkeeping.
    ///
    /// A dispatch period at or above the session timeout would let the server
    /// expire the session between flushes, so it is pulled below the timeout.
    pub fn normalize(&mut self) {
        if self.session_timeout_minutes == 0 {
            self.session_timeout_minutes = DEFAULT_SESSION_TIMEOUT_MINUTES;
        }
        if self.dispatch_period_minutes == 0 {
            self.dispatch_period_minutes = 1;
        }
        if self.periodic_dispatch_enabled
            && self.dispatch_period_minutes >= self.session_timeout_minutes
        {
            let clamped = self.session_timeout_minutes.saturating_sub(1).max(1);
            tracing::warn!(
                dispatch_period_minutes = self.dispatch_period_minutes,
                session_timeout_minutes = self.session_timeout_minutes,
                clamped,
                "dispatch period must be shorter than the session timeout"
            );
            self.dispatch_period_minutes = clamped;
        }
    }

    /// Parsed server URL.
    pub fn server_url(&self) -> CoreResult<Url> {
        Url::parse(&self.server_url).map_err(CoreError::from)
    }

    pub fn dispatch_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.dispatch_period_minutes) * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.session_timeout_minutes, 30);
        assert_eq!(config.dispatch_period_minutes, 5);
        assert_eq!(config.max_unauthorized_retries, 5);
        assert!(!config.periodic_dispatch_enabled);
    }

    #[test]
    fn test_config_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        std::fs::write(
            &config_path,
            r#"{ "log_level": "debug", "periodic_dispatch_enabled": true }"#,
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.periodic_dispatch_enabled);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            api_key: "key-123".to_string(),
            tracking_code: "TRK".to_string(),
            ..Config::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.session_timeout_minutes, 30);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CURIO_LOG_LEVEL", "trace"),
            ("CURIO_SERVER_URL", "http://localhost:9000/api"),
            ("CURIO_PERIODIC_DISPATCH", "On"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.server_url, "http://localhost:9000/api");
        assert!(config.periodic_dispatch_enabled);
    }

    #[test]
    fn test_blank_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|_| Some("  ".to_string()));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_dispatch_period_clamped_below_timeout() {
        let mut config = Config {
            periodic_dispatch_enabled: true,
            session_timeout_minutes: 10,
            dispatch_period_minutes: 10,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.dispatch_period_minutes, 9);

        let mut tiny = Config {
            periodic_dispatch_enabled: true,
            session_timeout_minutes: 1,
            dispatch_period_minutes: 3,
            ..Config::default()
        };
        tiny.normalize();
        assert_eq!(tiny.dispatch_period_minutes, 1);
    }

    #[test]
    fn test_period_left_alone_without_periodic_mode() {
        let mut config = Config {
            session_timeout_minutes: 10,
            dispatch_period_minutes: 20,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.dispatch_period_minutes, 20);
        assert_eq!(config.dispatch_period(), Duration::from_secs(1200));
    }

    #[test]
    fn test_config_invalid_url() {
        let config = Config {
            server_url: "not a valid url".to_string(),
            ..Config::default()
        };
        assert!(config.server_url().is_err());
    }
}

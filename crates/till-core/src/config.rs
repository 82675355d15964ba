//! Terminal configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use till_events::EventBusConfig;
use till_network::RetryConfig;
use till_session::SessionConfig;
use till_storage::StorageConfig;
use till_tabs::TabSyncConfig;

use crate::Result;

/// Database path that selects a throwaway in-memory store.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file, or `:memory:`
    pub database_path: PathBuf,
    /// Coordinate with other terminal tabs; off runs this context standalone
    pub cross_tab: bool,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub tabs: TabSyncConfig,
    pub events: EventBusConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("till.db"),
            cross_tab: true,
            session: SessionConfig::default(),
            retry: RetryConfig::default(),
            tabs: TabSyncConfig::default(),
            events: EventBusConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(PathBuf::new()).with_database_path(IN_MEMORY)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.session.validate()?;

        tracing::info!(path = %path.as_ref().display(), "Loaded terminal config");
        Ok(config)
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("Till"))
            .unwrap_or_else(|| PathBuf::from(".till"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    #[test]
    fn test_new_places_database_in_data_dir() {
        let config = Config::new(PathBuf::from("/var/lib/till"));
        assert_eq!(config.database_path, PathBuf::from("/var/lib/till/till.db"));
        assert!(config.cross_tab);
        assert!(!config.is_in_memory());
        assert!(Config::in_memory().is_in_memory());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "database_path": ":memory:",
                "session": { "max_lifetime_ms": 3600000 },
                "retry": { "max_attempts": 5 }
            }"#,
        )
        .unwrap();

        assert!(config.is_in_memory());
        assert_eq!(config.session.max_lifetime_ms, 3_600_000);
        assert_eq!(
            config.session.warning_threshold_ms,
            SessionConfig::default().warning_threshold_ms
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.events.max_history, 100);
        assert_eq!(config.storage.session_key, "till.session");
    }

    #[test]
    fn test_load_rejects_bad_thresholds() {
        let path = std::env::temp_dir().join(format!("till-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "session": { "warning_threshold_ms": 1000, "critical_threshold_ms": 5000 } }"#,
        )
        .unwrap();

        let result = Config::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(CoreError::Session(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/till/config.json");
        assert!(matches!(result, Err(CoreError::Io(_))));
    }
}

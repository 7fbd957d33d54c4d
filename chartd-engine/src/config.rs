//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CHARTD_CONFIG)
//! 3. Environment variables

use chartd_storage::FsyncPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Host configuration.
    pub host: HostConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CHARTD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.host.apply_env_overrides();
    }

    /// Checks settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.persistence != PersistenceLevel::None
            && self.storage.data_dir.as_os_str().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "storage.data_dir is required when persistence is enabled".to_string(),
            ));
        }
        if self.host.suspend_idle_ms > 0 && self.storage.persistence == PersistenceLevel::None {
            return Err(ConfigError::ValidationError(
                "host.suspend_idle_ms requires persistence".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// How much of a session's state is written to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceLevel {
    /// Nothing is persisted; sessions cannot be resumed.
    #[default]
    None,
    /// State is checkpointed every time the session waits for an event.
    StableState,
}

impl std::str::FromStr for PersistenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(PersistenceLevel::None),
            "stable_state" | "stable" => Ok(PersistenceLevel::StableState),
            other => Err(format!("unknown persistence level '{}'", other)),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one log file per persisted session.
    pub data_dir: PathBuf,
    /// Fsync policy for session logs.
    pub fsync_policy: FsyncPolicy,
    /// Persistence level for new sessions.
    pub persistence: PersistenceLevel,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_policy: FsyncPolicy::OnCheckpoint,
            persistence: PersistenceLevel::None,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CHARTD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(policy) = std::env::var("CHARTD_FSYNC") {
            match policy.parse() {
                Ok(p) => self.fsync_policy = p,
                Err(e) => tracing::warn!("Ignoring CHARTD_FSYNC: {}", e),
            }
        }

        if let Ok(level) = std::env::var("CHARTD_PERSISTENCE") {
            match level.parse() {
                Ok(l) => self.persistence = l,
                Err(e) => tracing::warn!("Ignoring CHARTD_PERSISTENCE: {}", e),
            }
        }
    }

    /// Returns the directory for session logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

/// Host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Idle time after which a waiting session suspends itself (0 = never).
    pub suspend_idle_ms: u64,
    /// Maximum number of registered sessions (0 = unlimited).
    pub max_sessions: usize,
    /// Free-form settings handed to data-model handlers and custom actions.
    pub configuration: HashMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            suspend_idle_ms: 0,
            max_sessions: 0, // unlimited
            configuration: HashMap::new(),
        }
    }
}

impl HostConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("CHARTD_SUSPEND_IDLE_MS") {
            if let Ok(n) = ms.parse() {
                self.suspend_idle_ms = n;
            }
        }

        if let Ok(max) = std::env::var("CHARTD_MAX_SESSIONS") {
            if let Ok(n) = max.parse() {
                self.max_sessions = n;
            }
        }
    }

    /// Returns the idle suspend period, if enabled.
    pub fn suspend_idle(&self) -> Option<Duration> {
        (self.suspend_idle_ms > 0).then(|| Duration::from_millis(self.suspend_idle_ms))
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.persistence, PersistenceLevel::None);
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::OnCheckpoint);
        assert_eq!(config.host.max_sessions, 0);
        assert!(config.host.suspend_idle().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_paths() {
        let config = StorageConfig::default();
        assert_eq!(config.sessions_dir(), PathBuf::from("./data/sessions"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.storage.persistence = PersistenceLevel::StableState;
        config.host.suspend_idle_ms = 250;
        config
            .host
            .configuration
            .insert("region".to_string(), "eu".to_string());

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.storage.persistence, PersistenceLevel::StableState);
        assert_eq!(parsed.host.suspend_idle(), Some(Duration::from_millis(250)));
        assert_eq!(parsed.host.configuration.get("region").unwrap(), "eu");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("host:\n  max_sessions: 8\n").unwrap();
        assert_eq!(parsed.host.max_sessions, 8);
        assert_eq!(parsed.storage.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chartd.yaml");
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("state");
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.data_dir, dir.path().join("state"));
        assert!(matches!(
            Config::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::IoError(..))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.host.suspend_idle_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        config.storage.persistence = PersistenceLevel::StableState;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persistence_level_parse() {
        assert_eq!(
            "stable_state".parse::<PersistenceLevel>().unwrap(),
            PersistenceLevel::StableState
        );
        assert_eq!("NONE".parse::<PersistenceLevel>().unwrap(), PersistenceLevel::None);
        assert!("always".parse::<PersistenceLevel>().is_err());
    }
}

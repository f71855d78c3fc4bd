use brewtracker_core::{CacheConfig, ConflictPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server URL (e.g., "http://localhost:8080" or "https://brew.example.com")
    pub server_url: Option<String>,
    /// API key for authentication
    pub api_key: Option<String>,
    /// Sync before reads and after writes (default: false)
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts before a failing operation is parked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Applied by `brew conflict resolve-all`
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            auto_sync: false,
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl SyncConfig {
    /// Returns true if sync is configured (has both server_url and api_key)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database holding the cache
    pub database_path: ConfigValue<PathBuf>,
    /// User whose cache is opened
    pub user_id: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    user_id: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let default_db_path = Self::default_data_dir().join("brew.db");

        // Start with defaults
        let mut database_path = ConfigValue::new(default_db_path, ConfigSource::Default);
        let mut user_id = ConfigValue::new("default".to_string(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(user) = file_config.user_id {
                user_id = ConfigValue::new(user, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("BREW_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(user) = std::env::var("BREW_USER_ID") {
            user_id = ConfigValue::new(user, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("BREW_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("BREW_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            user_id,
            config_file,
            sync,
        })
    }

    /// Cache settings derived from the sync section.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            retry: RetryPolicy {
                max_attempts: self.sync.max_attempts.max(1),
                ..RetryPolicy::default()
            },
            request_timeout: Duration::from_secs(self.sync.request_timeout_secs.max(1)),
            conflict_policy: self.sync.conflict_policy,
            auto_sync_interval: None,
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/brewtracker/
    /// - macOS: ~/Library/Application Support/brewtracker/
    /// - Windows: %APPDATA%/brewtracker/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brewtracker")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/brewtracker/
    /// - macOS: ~/Library/Application Support/brewtracker/
    /// - Windows: %APPDATA%/brewtracker/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brewtracker")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("brew.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.user_id.value, "default");
        assert_eq!(config.user_id.source, ConfigSource::Default);
        assert!(!config.sync.is_configured());
        assert_eq!(config.sync.request_timeout_secs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/brew.sqlite").unwrap();
        writeln!(file, "user_id: brewer42").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: http://localhost:5000").unwrap();
        writeln!(file, "  api_key: secret").unwrap();
        writeln!(file, "  max_attempts: 3").unwrap();
        writeln!(file, "  conflict_policy: prefer_server").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/brew.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.user_id.value, "brewer42");
        assert_eq!(config.user_id.source, ConfigSource::File);
        assert_eq!(config.config_file, Some(config_path));
        assert!(config.sync.is_configured());
        assert!(!config.sync.auto_sync);

        let cache_config = config.cache_config();
        assert_eq!(cache_config.retry.max_attempts, 3);
        assert_eq!(cache_config.conflict_policy, ConflictPolicy::PreferServer);
        assert_eq!(cache_config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_relative_database_path() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/brew.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/brew.db")
        );
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "user_id: fromfile").unwrap();

        std::env::set_var("BREW_USER_ID", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.user_id.value, "fromenv");
        assert_eq!(config.user_id.source, ConfigSource::Environment);

        std::env::remove_var("BREW_USER_ID");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_unknown_conflict_policy_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  conflict_policy: coin_flip").unwrap();

        assert!(Config::load(Some(config_path)).is_err());
    }
}

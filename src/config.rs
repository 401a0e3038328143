use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::store::DEFAULT_CAPACITY_BYTES;

const APP_DIR: &str = "compliance-cache";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// User namespace for cache keys; shared namespace when unset
  pub user_id: Option<String>,
  pub cache: CacheSettings,
  pub storage: StorageConfig,
  /// Remote sync target. The cache runs local-only when absent.
  pub remote: Option<RemoteConfig>,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub ttl_secs: u64,
  pub max_retries: u32,
  pub sync_interval_secs: u64,
  pub offline_mode: bool,
  /// Ping the remote on each sync tick while offline and come back online
  /// when it answers
  pub probe_offline: bool,
}

impl Default for CacheSettings {
  fn default() -> Self {
    let defaults = CacheConfig::default();
    Self {
      ttl_secs: defaults.ttl.as_secs(),
      max_retries: defaults.max_retries,
      sync_interval_secs: defaults.sync_interval.as_secs(),
      offline_mode: defaults.offline_mode,
      probe_offline: true,
    }
  }
}

impl CacheSettings {
  pub fn to_cache_config(&self) -> CacheConfig {
    CacheConfig {
      ttl: Duration::from_secs(self.ttl_secs),
      max_retries: self.max_retries,
      sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
      offline_mode: self.offline_mode,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/compliance-cache/store.db)
  pub path: Option<PathBuf>,
  pub capacity_bytes: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      capacity_bytes: DEFAULT_CAPACITY_BYTES,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  #[serde(default = "default_remote_table")]
  pub table: String,
}

fn default_remote_table() -> String {
  "cache_metadata".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is not set
  pub level: String,
  /// Log directory (default: $XDG_DATA_HOME/compliance-cache/logs)
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./compliance-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/compliance-cache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from(format!("{}.yaml", APP_DIR));
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty document parses as null, which means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the remote API key from the environment.
  ///
  /// Checks COMPLIANCE_CACHE_API_KEY.
  pub fn api_key() -> Option<String> {
    std::env::var("COMPLIANCE_CACHE_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }
}

/// Directory for the store database and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join(APP_DIR))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert!(config.remote.is_none());
    assert_eq!(config.cache.max_retries, 3);
    assert_eq!(config.cache.sync_interval_secs, 300);
    assert_eq!(config.storage.capacity_bytes, DEFAULT_CAPACITY_BYTES);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_partial_config() {
    let config = Config::from_yaml(
      r#"
user_id: "42"
cache:
  ttl_secs: 600
  offline_mode: true
remote:
  url: https://example.test
"#,
    )
    .unwrap();

    assert_eq!(config.user_id.as_deref(), Some("42"));
    assert_eq!(config.cache.ttl_secs, 600);
    assert_eq!(config.cache.max_retries, 3);
    assert!(config.cache.probe_offline);

    let remote = config.remote.unwrap();
    assert_eq!(remote.table, "cache_metadata");

    let cache = config.cache.to_cache_config();
    assert_eq!(cache.ttl, Duration::from_secs(600));
    assert!(cache.offline_mode);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}

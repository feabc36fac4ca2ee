use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ClientConfig, DEFAULT_PERSIST_KEY};
use crate::users::DEFAULT_API_URL;

/// Settings for the command-line front end.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub persistence: PersistenceConfig,
  /// Write logs here instead of stderr
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub url: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: DEFAULT_API_URL.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  pub cache_time_secs: u64,
  pub retry: u32,
  pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 0,
      cache_time_secs: 24 * 60 * 60,
      retry: 0,
      retry_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  /// Storage key of the snapshot record
  pub key: String,
  /// Snapshots written under another buster are discarded on startup
  pub buster: String,
  /// SQLite database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  pub max_age_secs: u64,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      key: DEFAULT_PERSIST_KEY.to_string(),
      buster: "2".to_string(),
      path: None,
      max_age_secs: 24 * 60 * 60,
    }
  }
}

impl PersistenceConfig {
  pub fn max_age(&self) -> Duration {
    Duration::from_secs(self.max_age_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-query.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-query/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("offline-query.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-query").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Client settings derived from the `cache` section.
  pub fn client_config(&self) -> ClientConfig {
    ClientConfig {
      stale_time: Duration::from_secs(self.cache.stale_time_secs),
      cache_time: Duration::from_secs(self.cache.cache_time_secs),
      retry: self.cache.retry,
      retry_delay: Duration::from_millis(self.cache.retry_delay_ms),
      ..ClientConfig::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::parse(
      r#"
api:
  url: http://localhost:3000
cache:
  retry: 2
persistence:
  buster: "3"
"#,
    )
    .unwrap();

    assert_eq!(config.api.url, "http://localhost:3000");
    assert_eq!(config.cache.retry, 2);
    assert_eq!(config.cache.cache_time_secs, 24 * 60 * 60);
    assert_eq!(config.persistence.buster, "3");
    assert_eq!(config.persistence.key, DEFAULT_PERSIST_KEY);
    assert!(config.log_file.is_none());
  }

  #[test]
  fn test_client_config_mapping() {
    let mut config = Config::default();
    config.cache.stale_time_secs = 30;
    config.cache.retry_delay_ms = 250;

    let client = config.client_config();
    assert_eq!(client.stale_time, Duration::from_secs(30));
    assert_eq!(client.cache_time, Duration::from_secs(24 * 60 * 60));
    assert_eq!(client.retry, 0);
    assert_eq!(client.retry_delay, Duration::from_millis(250));
    assert!(client.refetch_on_reconnect);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.yaml"))).is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "log_file: /tmp/offline-query.log\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.log_file, Some(PathBuf::from("/tmp/offline-query.log")));
    assert_eq!(config.api.url, DEFAULT_API_URL);
  }
}

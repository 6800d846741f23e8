use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheGroups;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the troop API
  pub url: String,
  /// Path receiving batched point updates
  pub batch_endpoint: String,
  /// Prefix for replaying other queued actions (`{prefix}{action}`)
  pub mutation_prefix: String,
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8080".to_string(),
      batch_endpoint: "/api/update-points".to_string(),
      mutation_prefix: "/api/".to_string(),
      request_timeout_secs: 30,
    }
  }
}

impl ServerConfig {
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.url).map_err(|e| eyre!("Invalid server url '{}': {}", self.url, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Store file (default: $XDG_DATA_HOME/troopsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Batch window for coalescing point changes
  pub debounce_ms: u64,
  /// Send the first change of an empty batch right away
  pub leading_edge: bool,
  /// Background refresh period while online and active
  pub refresh_interval_secs: u64,
  /// Inactivity after which the app reports itself dormant
  pub idle_timeout_secs: u64,
  /// Cache groups dropped when connectivity returns
  pub reconnect_invalidate: Vec<String>,
  /// Cache group dropped after point changes reach the server
  pub points_group: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 300,
      leading_edge: true,
      refresh_interval_secs: 300,
      idle_timeout_secs: 600,
      reconnect_invalidate: vec![
        "points".to_string(),
        "attendance".to_string(),
        "badges".to_string(),
      ],
      points_group: "points".to_string(),
    }
  }
}

impl SyncConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn refresh_interval(&self) -> Duration {
    // A zero period would make tokio's interval panic
    Duration::from_secs(self.refresh_interval_secs.max(1))
  }

  pub fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Named key groups; replaces the built-in groups when present
  #[serde(default)]
  pub groups: Option<CacheGroups>,
}

impl CacheConfig {
  pub fn groups(&self) -> CacheGroups {
    self.groups.clone().unwrap_or_default()
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./troopsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/troopsync/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("troopsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("troopsync").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.server.base_url()?;
    if self.sync.debounce_ms == 0 {
      return Err(eyre!("sync.debounce_ms must be greater than zero"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.sync.debounce(), Duration::from_millis(300));
    assert!(config.sync.leading_edge);
    assert_eq!(config.sync.idle_timeout(), Duration::from_secs(600));
    assert_eq!(config.server.batch_endpoint, "/api/update-points");
    assert!(config.cache.groups().members("points").is_some());
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
server:
  url: https://troop.example.org
sync:
  debounce_ms: 150
  reconnect_invalidate: [points]
cache:
  groups:
    points: [manage_points_data, "points_*"]
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.server.url, "https://troop.example.org");
    assert_eq!(config.server.request_timeout_secs, 30);
    assert_eq!(config.sync.debounce_ms, 150);
    assert_eq!(config.sync.refresh_interval_secs, 300);
    assert_eq!(config.sync.reconnect_invalidate, vec!["points".to_string()]);

    let groups = config.cache.groups();
    assert!(groups.contains("points", "points_week"));
    assert!(groups.members("badges").is_none());
    config.validate().unwrap();
  }

  #[test]
  fn test_invalid_url_rejected() {
    let config = Config::from_yaml("server:\n  url: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}

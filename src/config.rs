use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::PolicySettings;
use crate::sync::DEFAULT_MAX_RETRIES;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// User the queued actions are attributed to
  pub user_id: Option<String>,
  pub remote: RemoteConfig,
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  /// Where the databases and logs live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub base_url: String,
  pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_ORIGIN.to_string(),
      request_timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Period of the background drain while online
  pub interval_secs: u64,
  pub max_retries: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      max_retries: DEFAULT_MAX_RETRIES,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Application origin; same-origin responses are the cacheable ones
  pub origin: String,
  pub quota_bytes: u64,
  /// Fraction of the quota that triggers eviction of purgeable caches
  pub quota_threshold: f64,
  pub purge_batch_size: usize,
  pub network_timeout_ms: u64,
  /// Paths fetched when the interceptor installs
  pub precache: Vec<String>,
  /// Activate a newly installed interceptor without waiting for SKIP_WAITING
  pub auto_activate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      origin: DEFAULT_ORIGIN.to_string(),
      quota_bytes: 50 * 1024 * 1024,
      quota_threshold: 0.8,
      purge_batch_size: 10,
      network_timeout_ms: 3000,
      precache: vec![
        "/".to_string(),
        "/offline".to_string(),
        "/manifest.json".to_string(),
      ],
      auto_activate: true,
    }
  }
}

impl RemoteConfig {
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.base_url).map_err(|e| eyre!("Invalid remote.base_url {}: {}", self.base_url, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

impl CacheConfig {
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid cache.origin {}: {}", self.origin, e))
  }

  pub fn policy_settings(&self) -> PolicySettings {
    PolicySettings {
      network_timeout: Duration::from_millis(self.network_timeout_ms),
      quota_threshold: self.quota_threshold,
      purge_batch_size: self.purge_batch_size,
    }
  }

  /// Precache paths resolved against the origin.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let origin = self.origin()?;
    self
      .precache
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid precache URL {}: {}", path, e))
      })
      .collect()
  }
}

const DEFAULT_ORIGIN: &str = "http://localhost:3000";

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chat-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chat-offline/config.yaml
  ///
  /// Without a file the defaults apply. `CHAT_OFFLINE_USER_ID` overrides `user_id`.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(user_id) = std::env::var("CHAT_OFFLINE_USER_ID") {
      config.user_id = Some(user_id);
    }
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("chat-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chat-offline").join("config.yaml");
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

  fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    self.remote.base_url()?;
    self.cache.precache_urls()?;
    let threshold = self.cache.quota_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
      return Err(eyre!(
        "cache.quota_threshold must be in (0, 1], got {}",
        threshold
      ));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be positive"));
    }
    if self.sync.max_retries == 0 {
      return Err(eyre!("sync.max_retries must be at least 1"));
    }
    Ok(())
  }

  pub fn data_dir(&self) -> PathBuf {
    self.data_dir.clone().unwrap_or_else(|| {
      dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-offline")
    })
  }

  /// Get the remote API token from the environment, if set.
  ///
  /// Checks CHAT_OFFLINE_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CHAT_OFFLINE_TOKEN").ok()
  }

  pub fn require_user_id(&self) -> Result<&str> {
    self.user_id.as_deref().ok_or_else(|| {
      eyre!("No user id configured. Set user_id in the config file or CHAT_OFFLINE_USER_ID.")
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.sync.interval_secs, 30);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.cache.quota_bytes, 50 * 1024 * 1024);
    assert_eq!(config.cache.network_timeout_ms, 3000);
    assert!(config.cache.auto_activate);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
user_id: u1
sync:
  max_retries: 5
cache:
  origin: https://chat.example.com
  precache: ["/"]
"#,
    )
    .unwrap();
    assert_eq!(config.user_id.as_deref(), Some("u1"));
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.interval_secs, 30);
    assert_eq!(config.cache.quota_threshold, 0.8);
    assert_eq!(
      config.cache.precache_urls().unwrap(),
      vec![Url::parse("https://chat.example.com/").unwrap()]
    );
  }

  #[test]
  fn test_policy_settings() {
    let settings = CacheConfig::default().policy_settings();
    assert_eq!(settings.network_timeout, Duration::from_millis(3000));
    assert_eq!(settings.purge_batch_size, 10);
  }

  #[test]
  fn test_rejects_bad_threshold() {
    let config = Config::from_yaml("cache:\n  quota_threshold: 1.5\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_bad_origin() {
    let config = Config::from_yaml("cache:\n  origin: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());

    let path = dir.path().join("config.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "data_dir: /tmp/chat-offline-test").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.data_dir(), PathBuf::from("/tmp/chat-offline-test"));
  }
}

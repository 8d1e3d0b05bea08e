use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::SyncPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub endpoints: EndpointsConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Absolute base URL, e.g. https://api.example.com
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

/// Endpoint path templates, relative to `api.base_url`.
///
/// `{owner_id}` is replaced with the signed-in user's id.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
  #[serde(default = "default_notifications")]
  pub notifications: String,
  #[serde(default = "default_messages")]
  pub messages: String,
  #[serde(default = "default_followers")]
  pub followers: String,
}

fn default_notifications() -> String {
  "/api/notifications".to_string()
}

fn default_messages() -> String {
  "/api/messages".to_string()
}

fn default_followers() -> String {
  "/api/followers/{owner_id}".to_string()
}

impl Default for EndpointsConfig {
  fn default() -> Self {
    Self {
      notifications: default_notifications(),
      messages: default_messages(),
      followers: default_followers(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// When false nothing is persisted and every read goes to the network
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/feedcache/cache.db)
  pub path: Option<PathBuf>,
}

fn default_true() -> bool {
  true
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
  3
}

fn default_retry_delay_ms() -> u64 {
  500
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      retry_delay_ms: default_retry_delay_ms(),
    }
  }
}

impl SyncConfig {
  pub fn policy(&self) -> SyncPolicy {
    SyncPolicy {
      max_attempts: self.max_attempts.max(1),
      retry_delay: Duration::from_millis(self.retry_delay_ms),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse and validate configuration from YAML text.
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let base = self.api.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
      return Err(eyre!(
        "api.base_url must include http:// or https://, got {:?}",
        self.api.base_url
      ));
    }
    url::Url::parse(base).map_err(|e| eyre!("Invalid api.base_url: {}", e))?;
    Ok(())
  }

  /// Full endpoint template for a configured path.
  pub fn endpoint_url(&self, path: &str) -> String {
    format!(
      "{}/{}",
      self.api.base_url.trim().trim_end_matches('/'),
      path.trim_start_matches('/')
    )
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks FEEDCACHE_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FEEDCACHE_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set FEEDCACHE_TOKEN or API_TOKEN environment variable.")
      })
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheOptions, RetryPolicy};

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Backend root, e.g. "http://127.0.0.1:8000"
  pub base_url: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_API_URL.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  /// How long an unobserved list stays cached
  pub gc_time_secs: u64,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      gc_time_secs: 600,
      refetch_on_window_focus: false,
      refetch_on_reconnect: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset
  pub level: String,
  /// Log file (defaults to $XDG_DATA_HOME/hpadmin/hpadmin.log)
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl LogConfig {
  pub fn file_path(&self) -> Option<PathBuf> {
    self
      .file
      .clone()
      .or_else(|| dirs::data_dir().map(|dir| dir.join("hpadmin").join("hpadmin.log")))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hpadmin.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hpadmin/config.yaml
  ///
  /// Without a config file every setting takes its default. The API URL can
  /// be overridden by HPADMIN_API_URL or API_URL.
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
      None => Self::default(),
    };
    config.apply_env(|name| std::env::var(name).ok());
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hpadmin.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hpadmin").join("config.yaml");
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
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Checks HPADMIN_API_URL first, then API_URL as fallback.
  fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("HPADMIN_API_URL")
      .or_else(|| var("API_URL"))
      .filter(|url| !url.trim().is_empty())
    {
      self.api.base_url = url;
    }
  }

  pub fn cache_options(&self) -> CacheOptions {
    CacheOptions {
      stale_time: Duration::from_secs(self.cache.stale_time_secs),
      gc_time: Duration::from_secs(self.cache.gc_time_secs),
      retry: RetryPolicy {
        max_retries: self.retry.max_retries,
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        max_delay: Duration::from_millis(self.retry.max_delay_ms),
      },
      refetch_on_window_focus: self.cache.refetch_on_window_focus,
      refetch_on_reconnect: self.cache.refetch_on_reconnect,
    }
  }
}

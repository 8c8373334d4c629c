use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheOptions;
use crate::remote::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {0}")]
  NotFound(PathBuf),

  #[error("no configuration file found. Create one at ./gh-mirror.yaml or ~/.config/gh-mirror/config.yaml")]
  Missing,

  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub github: GitHubConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
  pub owner: String,
  pub repo: String,
  /// Base API url; point at /api/v3 for GitHub Enterprise
  #[serde(default = "default_api_url")]
  pub api_url: String,
  /// Requests kept in reserve before waiting for the rate limit reset
  #[serde(default = "default_rate_limit_buffer")]
  pub rate_limit_buffer: u64,
}

fn default_api_url() -> String {
  "https://api.github.com".to_string()
}

fn default_rate_limit_buffer() -> u64 {
  100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Durable store location (default: $XDG_DATA_HOME/gh-mirror/cache.db)
  pub path: Option<PathBuf>,
  /// Keep the durable tier on disk; false runs memory-only
  pub persist: bool,
  pub freshness_secs: u64,
  pub stale_secs: u64,
  pub batch_size: usize,
  pub force_full_sync: bool,
  pub background_refresh: bool,
  pub sweep_interval_secs: u64,
  /// Promote a delta to a full sync after this long without one; unset disables
  pub full_resync_after_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      persist: true,
      freshness_secs: 3600,
      stale_secs: 86_400,
      batch_size: 100,
      force_full_sync: false,
      background_refresh: true,
      sweep_interval_secs: 300,
      full_resync_after_secs: None,
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      freshness_window: seconds(self.freshness_secs),
      stale_window: seconds(self.stale_secs),
      batch_size: self.batch_size,
      force_full_sync: self.force_full_sync,
      background_refresh: self.background_refresh,
      full_resync_after: self.full_resync_after_secs.map(seconds),
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

/// Upper bound for configured windows; larger values are clamped.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> chrono::Duration {
  // MAX_WINDOW_SECS fits in i64
  chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub rate_limit_wait_cap_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
      rate_limit_wait_cap_secs: policy.rate_limit_wait_cap.as_secs(),
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      base_delay: Duration::from_millis(self.base_delay_ms),
      max_delay: Duration::from_millis(self.max_delay_ms),
      rate_limit_wait_cap: Duration::from_secs(self.rate_limit_wait_cap_secs),
      ..RetryPolicy::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
  /// Root for the inbox and outbox directories
  pub root: PathBuf,
  pub inbox: String,
  pub outbox: String,
}

impl Default for WorkspaceConfig {
  fn default() -> Self {
    Self {
      root: PathBuf::from("."),
      inbox: "inbox".to_string(),
      outbox: "outbox".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gh-mirror.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gh-mirror/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = match explicit_path {
      Some(p) if p.exists() => p.to_path_buf(),
      Some(p) => return Err(ConfigError::NotFound(p.to_path_buf())),
      None => Self::find_config_file().ok_or(ConfigError::Missing)?,
    };
    Self::load_from_path(&path)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("gh-mirror.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gh-mirror").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    let config: Config = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    config.validate()?;
    Ok(config)
  }

  pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
    let config: Config = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
      path: PathBuf::from("<inline>"),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.github.owner.trim().is_empty() || self.github.repo.trim().is_empty() {
      return Err(ConfigError::Invalid("github.owner and github.repo are required".to_string()));
    }
    if self.cache.freshness_secs >= self.cache.stale_secs {
      return Err(ConfigError::Invalid(format!(
        "cache.freshness_secs ({}) must be less than cache.stale_secs ({})",
        self.cache.freshness_secs, self.cache.stale_secs
      )));
    }
    if self.cache.batch_size == 0 {
      return Err(ConfigError::Invalid("cache.batch_size must be at least 1".to_string()));
    }
    if self.cache.sweep_interval_secs == 0 {
      return Err(ConfigError::Invalid("cache.sweep_interval_secs must be at least 1".to_string()));
    }
    if self.retry.max_attempts == 0 {
      return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
    }
    Ok(())
  }

  /// GitHub token from the environment.
  ///
  /// Checks GH_MIRROR_TOKEN first, then GITHUB_TOKEN. Anonymous access works
  /// for public repositories, at a much lower rate limit.
  pub fn api_token() -> Option<String> {
    std::env::var("GH_MIRROR_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Directory for the durable store and log files
  pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("gh-mirror"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml_str("github:\n  owner: acme\n  repo: widgets\n").unwrap();
    assert_eq!(config.github.api_url, "https://api.github.com");
    assert_eq!(config.github.rate_limit_buffer, 100);
    assert!(config.cache.persist);

    let options = config.cache.options();
    assert_eq!(options.freshness_window, chrono::Duration::hours(1));
    assert_eq!(options.stale_window, chrono::Duration::hours(24));
    assert_eq!(options.batch_size, 100);
    assert!(options.full_resync_after.is_none());
    assert_eq!(config.retry.policy().max_attempts, 4);
  }

  #[test]
  fn test_cache_overrides() {
    let yaml = r#"
github:
  owner: acme
  repo: widgets
cache:
  freshness_secs: 60
  stale_secs: 600
  batch_size: 10
  full_resync_after_secs: 604800
"#;
    let options = Config::from_yaml_str(yaml).unwrap().cache.options();
    assert_eq!(options.freshness_window, chrono::Duration::minutes(1));
    assert_eq!(options.batch_size, 10);
    assert_eq!(options.full_resync_after, Some(chrono::Duration::days(7)));
  }

  #[test]
  fn test_freshness_must_be_below_stale() {
    let yaml = "github:\n  owner: acme\n  repo: widgets\ncache:\n  freshness_secs: 600\n  stale_secs: 600\n";
    assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn test_zero_batch_size_is_rejected() {
    let yaml = "github:\n  owner: acme\n  repo: widgets\ncache:\n  batch_size: 0\n";
    assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn test_zero_sweep_interval_is_rejected() {
    let yaml = "github:\n  owner: acme\n  repo: widgets\ncache:\n  sweep_interval_secs: 0\n";
    assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn test_huge_windows_are_clamped() {
    let cache = CacheConfig {
      freshness_secs: u64::MAX / 2,
      stale_secs: u64::MAX,
      full_resync_after_secs: Some(i64::MAX as u64),
      ..CacheConfig::default()
    };
    let options = cache.options();
    let max = chrono::Duration::seconds(MAX_WINDOW_SECS as i64);
    assert_eq!(options.freshness_window, max);
    assert_eq!(options.stale_window, max);
    assert_eq!(options.full_resync_after, Some(max));
    // Windows stay usable in timestamp arithmetic
    assert!(crate::cache::now() - options.stale_window < crate::cache::now());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)));
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, loaded from a YAML file with serde defaults for
/// every knob so a minimal file (or none at all) still works.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub edge: EdgeConfig,
  /// Override for the entity database location (default: data dir)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the remote API, e.g. "https://krawl.app/api"
  pub base_url: String,
  /// Per-request timeout in seconds
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// Probe timeout - a probe slower than this counts as unreachable
  #[serde(default = "default_probe_timeout")]
  pub probe_timeout_secs: u64,
  /// How long a probe result is reused before re-probing
  #[serde(default = "default_cache_window")]
  pub cache_window_secs: u64,
  /// Background re-check interval
  #[serde(default = "default_check_interval")]
  pub check_interval_secs: u64,
  /// Same-origin static resource probed when the health endpoint fails
  #[serde(default = "default_fallback_path")]
  pub fallback_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
  /// A token expiring within this window is refreshed proactively
  #[serde(default = "default_refresh_threshold")]
  pub refresh_threshold_secs: u64,
  /// Override for the durable credential file location (default: data dir)
  pub credential_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Timer-driven replay interval, the safety net behind the
  /// reconnect-triggered replay
  #[serde(default = "default_replay_interval")]
  pub replay_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
  /// Cache generation tag; bumping it on deploy wipes every older
  /// generation on activation
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  /// Fetch timeout for intercepted requests
  #[serde(default = "default_probe_timeout")]
  pub fetch_timeout_secs: u64,
  /// Path served as fallback for failed HTML navigations
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Hosts that are never intercepted (map tile CDNs and the like)
  #[serde(default = "default_excluded_hosts")]
  pub excluded_hosts: Vec<String>,
  /// Override for the response cache location (default: data dir)
  pub cache_path: Option<PathBuf>,
}

fn default_request_timeout() -> u64 {
  30
}

fn default_probe_timeout() -> u64 {
  5
}

fn default_cache_window() -> u64 {
  5
}

fn default_check_interval() -> u64 {
  10
}

fn default_fallback_path() -> String {
  "/manifest.json".to_string()
}

fn default_refresh_threshold() -> u64 {
  5 * 60
}

fn default_replay_interval() -> u64 {
  30
}

fn default_cache_version() -> String {
  "v3".to_string()
}

fn default_offline_page() -> String {
  "/offline".to_string()
}

fn default_excluded_hosts() -> Vec<String> {
  [
    "tile.openstreetmap.org",
    "tiles.stadiamaps.com",
    "basemaps.cartocdn.com",
    "server.arcgisonline.com",
    "tile.opentopomap.org",
    "api.mapbox.com",
    "maps.wikimedia.org",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_timeout_secs: default_probe_timeout(),
      cache_window_secs: default_cache_window(),
      check_interval_secs: default_check_interval(),
      fallback_path: default_fallback_path(),
    }
  }
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      refresh_threshold_secs: default_refresh_threshold(),
      credential_path: None,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      replay_interval_secs: default_replay_interval(),
    }
  }
}

impl Default for EdgeConfig {
  fn default() -> Self {
    Self {
      cache_version: default_cache_version(),
      fetch_timeout_secs: default_probe_timeout(),
      offline_page: default_offline_page(),
      excluded_hosts: default_excluded_hosts(),
      cache_path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./krawl-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/krawl/sync.yaml
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
      None => {
        // KRAWL_API_URL alone is enough to run without a config file
        let base_url = std::env::var("KRAWL_API_URL")
          .map_err(|_| eyre!("No configuration file found and KRAWL_API_URL not set"))?;
        Ok(Self::with_base_url(base_url))
      }
    }
  }

  /// Build a config with defaults around a single API base URL.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        request_timeout_secs: default_request_timeout(),
      },
      connectivity: ConnectivityConfig::default(),
      auth: AuthConfig::default(),
      sync: SyncConfig::default(),
      edge: EdgeConfig::default(),
      database_path: None,
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("krawl-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("krawl").join("sync.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.request_timeout_secs)
  }

  /// Health endpoint probed by the connectivity monitor.
  pub fn health_url(&self) -> String {
    format!("{}/health", self.api.base_url.trim_end_matches('/'))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_yaml() {
    let config: Config = serde_yaml::from_str("api:\n  base_url: http://localhost:8080/api\n")
      .expect("minimal config should parse");
    assert_eq!(config.api.base_url, "http://localhost:8080/api");
    assert_eq!(config.connectivity.probe_timeout_secs, 5);
    assert_eq!(config.auth.refresh_threshold_secs, 300);
    assert_eq!(config.edge.cache_version, "v3");
  }

  #[test]
  fn test_health_url_trims_trailing_slash() {
    let config = Config::with_base_url("http://localhost:8080/api/");
    assert_eq!(config.health_url(), "http://localhost:8080/api/health");
  }

  #[test]
  fn test_excluded_hosts_default_covers_tile_servers() {
    let config = Config::with_base_url("http://localhost:8080/api");
    assert!(config
      .edge
      .excluded_hosts
      .iter()
      .any(|h| h == "tile.openstreetmap.org"));
  }
}

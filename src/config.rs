use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application, e.g. "https://tasks.example.com"
  pub origin: String,
  /// Same-origin paths under this prefix are API calls
  pub api_prefix: String,
  /// Probed with HEAD to decide whether the backend is reachable
  pub health_endpoint: String,
  /// Where the cache and queue databases live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  /// Bump to invalidate every partition from older deployments
  pub version: String,
  /// Application shell primed at install time
  pub shell: Vec<String>,
  pub offline_page: Option<String>,
  /// Extensions (without the dot) served cache-first
  pub static_extensions: Vec<String>,
  /// Keep caches on disk; otherwise they only live for the process
  pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub poll_interval_secs: u64,
  pub probe_timeout_secs: u64,
  pub replay_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      api_prefix: "/api".to_string(),
      health_endpoint: "/api/health".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "lifeline".to_string(),
      version: "v1".to_string(),
      shell: ["/", "/index.html", "/manifest.json", "/favicon.ico", "/offline.html"]
        .map(String::from)
        .to_vec(),
      offline_page: Some("/offline.html".to_string()),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
        "eot",
      ]
      .map(String::from)
      .to_vec(),
      persist: true,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: 30,
      probe_timeout_secs: 5,
      replay_timeout_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lifeline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifeline/config.yaml
  ///
  /// Without a file the defaults are used.
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
    let local = PathBuf::from("lifeline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifeline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Absolute URL of the health endpoint.
  pub fn health_url(&self) -> Result<Url> {
    self
      .origin_url()?
      .join(&self.health_endpoint)
      .map_err(|e| eyre!("Invalid health endpoint '{}': {}", self.health_endpoint, e))
  }
}

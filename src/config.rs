use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base of the REST API, e.g. `https://host/japp`
  pub base_url: String,
  /// User whose entries are mirrored locally
  pub username: String,
  /// Origin of the app shell, used to resolve relative precache paths
  pub origin: Option<String>,
}

impl ApiConfig {
  fn base(&self) -> &str {
    self.base_url.trim_end_matches('/')
  }

  pub fn create_url(&self) -> String {
    format!("{}/create", self.base())
  }

  pub fn entry_url(&self, id: &str) -> String {
    format!("{}/entries/{}", self.base(), id)
  }

  pub fn entries_url(&self) -> String {
    format!("{}/entries/{}", self.base(), self.username)
  }

  pub fn visibility_url(&self, id: &str) -> String {
    format!("{}/entries/{}/status", self.base(), id)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version string embedded in partition names
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// App-shell URLs fetched eagerly at install time
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      precache: default_precache(),
    }
  }
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_precache() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/favicon.ico"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  #[serde(default = "default_shell_prefixes")]
  pub shell_prefixes: Vec<String>,
  /// Hosts never intercepted (media embeds and the like), case-insensitive
  #[serde(default = "default_bypass_hosts", deserialize_with = "deserialize_lowercase")]
  pub bypass_hosts: Vec<String>,
  #[serde(default = "default_image_extensions", deserialize_with = "deserialize_lowercase")]
  pub image_extensions: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_prefix: default_api_prefix(),
      shell_prefixes: default_shell_prefixes(),
      bypass_hosts: default_bypass_hosts(),
      image_extensions: default_image_extensions(),
    }
  }
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn default_api_prefix() -> String {
  "/japp/".to_string()
}

fn default_shell_prefixes() -> Vec<String> {
  vec!["/static/js/".to_string(), "/static/css/".to_string()]
}

fn default_bypass_hosts() -> Vec<String> {
  vec!["open.spotify.com".to_string(), "api.spotify.com".to_string()]
}

fn default_image_extensions() -> Vec<String> {
  ["jpg", "jpeg", "png", "gif", "svg", "webp"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  /// Upper bound on one network request: network-first reads, replays, precache fetches
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

fn default_timeout_secs() -> u64 {
  8
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Tag carried by background wake events that should trigger a drain
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  #[serde(default = "default_backoff_max_secs")]
  pub backoff_max_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      max_attempts: default_max_attempts(),
      backoff_base_secs: default_backoff_base_secs(),
      backoff_max_secs: default_backoff_max_secs(),
    }
  }
}

fn default_sync_tag() -> String {
  "sync-journal-entries".to_string()
}

fn default_max_attempts() -> u32 {
  8
}

fn default_backoff_base_secs() -> u64 {
  30
}

fn default_backoff_max_secs() -> u64 {
  3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
  /// Activate a freshly installed version without waiting for consumers to close
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Directory holding the store and HTTP cache databases
  pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
  pub fn resolve_data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lanesync"))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Log to stderr instead of the rolling file in the data directory
  #[serde(default)]
  pub stderr: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      stderr: false,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lanesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lanesync/config.yaml
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
        "No configuration file found. Create one at ~/.config/lanesync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("lanesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lanesync").join("config.yaml");
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

  /// Bearer token for the API, if one is configured.
  ///
  /// Read from LANESYNC_AUTH_TOKEN.
  pub fn auth_token() -> Option<String> {
    std::env::var("LANESYNC_AUTH_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

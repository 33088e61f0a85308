use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app is served from, e.g. "https://someone.github.io"
  pub origin: String,
  /// Deployment prefix under the origin, e.g. "/solver"
  #[serde(deserialize_with = "deserialize_base_path")]
  pub base_path: String,
  /// Cache generation; bumping it rolls both partitions over
  pub version: String,
  pub core_prefix: String,
  pub runtime_prefix: String,
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting_on_install: bool,
  /// App shell paths, relative to `base_path`
  pub core_assets: Vec<String>,
  /// Third-party library URLs pre-warmed into the core partition
  pub cdn_resources: Vec<String>,
  pub classification: ClassificationConfig,
  pub intercept: InterceptConfig,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
  /// Directory for daily log files (stderr only when unset)
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      base_path: String::new(),
      version: "v2".to_string(),
      core_prefix: "math-chem-solver".to_string(),
      runtime_prefix: "runtime-cache".to_string(),
      skip_waiting_on_install: true,
      core_assets: strings(&[
        "/",
        "/index.html",
        "/styles.css",
        "/app.js",
        "/manifest.json",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
      ]),
      cdn_resources: strings(&[
        "https://cdn.jsdelivr.net/npm/@mlc-ai/web-llm@0.2.46/lib/index.min.js",
        "https://cdn.jsdelivr.net/npm/tesseract.js@5/dist/tesseract.min.js",
      ]),
      classification: ClassificationConfig::default(),
      intercept: InterceptConfig::default(),
      network: NetworkConfig::default(),
      storage: StorageConfig::default(),
      log_dir: None,
    }
  }
}

/// Substring tables that drive resource classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
  pub app_extensions: Vec<String>,
  pub icons_segment: String,
  pub cdn_hosts: Vec<String>,
  pub model_hosts: Vec<String>,
  pub model_path_markers: Vec<String>,
}

impl Default for ClassificationConfig {
  fn default() -> Self {
    Self {
      app_extensions: strings(&[".html", ".css", ".js", ".json", ".png"]),
      icons_segment: "/icons/".to_string(),
      cdn_hosts: strings(&["cdn.jsdelivr.net", "unpkg.com"]),
      model_hosts: strings(&["huggingface.co"]),
      model_path_markers: strings(&["tessdata", ".wasm", "mlc-chat-config", "ndarray-cache"]),
    }
  }
}

/// Requests the router never intercepts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  pub excluded_schemes: Vec<String>,
  /// Matched as substrings of the host
  pub excluded_hosts: Vec<String>,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      excluded_schemes: strings(&["chrome-extension", "moz-extension", "safari-web-extension"]),
      excluded_hosts: strings(&["browser-sync"]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Whole-request timeout; no timeout when unset
  pub timeout_secs: Option<u64>,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: None,
      user_agent: concat!("offline-cache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/offline-cache/cache.db)
  pub path: Option<PathBuf>,
}

fn strings(values: &[&str]) -> Vec<String> {
  values.iter().map(|s| s.to_string()).collect()
}

fn deserialize_base_path<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  Ok(normalize_base_path(&raw))
}

/// "solver/" -> "/solver", "/" -> ""
fn normalize_base_path(raw: &str) -> String {
  let trimmed = raw.trim().trim_end_matches('/');
  if trimmed.is_empty() {
    String::new()
  } else if trimmed.starts_with('/') {
    trimmed.to_string()
  } else {
    format!("/{}", trimmed)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
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
      None => {
        tracing::debug!("No config file found, using defaults");
        Self::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.core_partition() == self.runtime_partition() {
      return Err(eyre!(
        "core and runtime partitions must have different names (both are '{}')",
        self.core_partition()
      ));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn core_partition(&self) -> String {
    format!("{}-{}", self.core_prefix, self.version)
  }

  pub fn runtime_partition(&self) -> String {
    format!("{}-{}", self.runtime_prefix, self.version)
  }

  /// Resolve a path under the deployment's base path to an absolute URL.
  pub fn app_url(&self, path: &str) -> Result<Url> {
    let origin = self.origin_url()?.origin().ascii_serialization();
    let joined = format!("{}{}{}", origin, self.base_path, path);
    Url::parse(&joined).map_err(|e| eyre!("Invalid asset URL '{}': {}", joined, e))
  }

  /// The app shell served to navigations that cannot be satisfied otherwise.
  pub fn shell_url(&self) -> Result<Url> {
    self.app_url("/index.html")
  }

  pub fn install_set(&self) -> Result<Vec<Url>> {
    self.core_assets.iter().map(|p| self.app_url(p)).collect()
  }

  pub fn cdn_urls(&self) -> Result<Vec<Url>> {
    self
      .cdn_resources
      .iter()
      .map(|u| Url::parse(u).map_err(|e| eyre!("Invalid CDN URL '{}': {}", u, e)))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_name_both_partitions() {
    let config = Config::default();
    assert_eq!(config.core_partition(), "math-chem-solver-v2");
    assert_eq!(config.runtime_partition(), "runtime-cache-v2");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_base_path_normalization() {
    assert_eq!(normalize_base_path(""), "");
    assert_eq!(normalize_base_path("/"), "");
    assert_eq!(normalize_base_path("solver/"), "/solver");
    assert_eq!(normalize_base_path("/apps/solver"), "/apps/solver");
  }

  #[test]
  fn test_install_set_resolves_against_base_path() {
    let config = Config::from_yaml(
      "origin: https://someone.github.io\nbase_path: solver/\ncore_assets: ['/', '/index.html']\n",
    )
    .unwrap();

    let urls: Vec<String> = config
      .install_set()
      .unwrap()
      .into_iter()
      .map(|u| u.to_string())
      .collect();
    assert_eq!(
      urls,
      vec![
        "https://someone.github.io/solver/",
        "https://someone.github.io/solver/index.html",
      ]
    );
    assert_eq!(
      config.shell_url().unwrap().as_str(),
      "https://someone.github.io/solver/index.html"
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config =
      Config::from_yaml("version: v3\nclassification:\n  cdn_hosts: [esm.sh]\n").unwrap();
    assert_eq!(config.core_partition(), "math-chem-solver-v3");
    assert_eq!(config.classification.cdn_hosts, vec!["esm.sh"]);
    assert_eq!(config.classification.model_hosts, vec!["huggingface.co"]);
    assert!(config.skip_waiting_on_install);
  }

  #[test]
  fn test_validate_rejects_colliding_partitions() {
    let config = Config::from_yaml("core_prefix: cache\nruntime_prefix: cache\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_bad_origin() {
    let config = Config::from_yaml("origin: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/offline-cache.yaml"))).is_err());
  }
}

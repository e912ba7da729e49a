//! Application configuration management.
//!
//! This module handles loading and saving the worker configuration: the
//! deployment version, the origin it serves, the precache manifest and the
//! routing and activation policies.
//!
//! Configuration is stored at `~/.config/monie/config.json`. A few fields can
//! be overridden from the environment (`MONIE_ORIGIN`, `MONIE_VERSION`,
//! `MONIE_NOTIFICATIONS`), which is how deployments pin the version.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::cache::{GenerationId, PrecacheManifest};
use crate::worker::{ActivationPolicy, CacheMissPolicy, WorkerConfig};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "monie";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Version token of the current deployment
const DEFAULT_VERSION: &str = "monie-v47";

const DEFAULT_ORIGIN: &str = "http://localhost:3000/";

/// Default request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Everything the app shell needs offline
const DEFAULT_MANIFEST: [&str; 16] = [
    "./",
    "index.html",
    "script.js",
    "style.css",
    "api/latest.json",
    "lib/localforage.min.js",
    "img/icon48.png",
    "img/icon48-mono.png",
    "img/icon72.png",
    "img/icon96.png",
    "img/icon144.png",
    "img/icon168.png",
    "img/icon192.png",
    "img/icon384.png",
    "favicon.ico",
    "manifest.json",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub origin: String,
    pub manifest: Vec<String>,
    /// Stands in for the platform notification permission.
    pub notifications_granted: bool,
    pub cache_miss: CacheMissPolicy,
    pub activation: ActivationPolicy,
    pub request_timeout_secs: u64,
    /// Also write logs to a daily file under the cache directory.
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
            notifications_granted: true,
            cache_miss: CacheMissPolicy::default(),
            activation: ActivationPolicy::default(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            log_to_file: false,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Write the default config file unless one exists. Returns its path and
    /// whether it was written.
    pub fn init() -> Result<(PathBuf, bool)> {
        let path = Self::config_path()?;
        if path.exists() {
            return Ok((path, false));
        }
        Self::default().save_to(&path)?;
        Ok((path, true))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = lookup("MONIE_ORIGIN") {
            self.origin = origin;
        }
        if let Some(version) = lookup("MONIE_VERSION") {
            self.version = version;
        }
        if let Some(value) = lookup("MONIE_NOTIFICATIONS") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.notifications_granted = true,
                "0" | "false" | "no" => self.notifications_granted = false,
                other => warn!(value = other, "Ignoring invalid MONIE_NOTIFICATIONS"),
            }
        }
    }

    pub fn worker_config(&self) -> Result<WorkerConfig> {
        let mut origin = Url::parse(&self.origin)
            .with_context(|| format!("Invalid origin {:?}", self.origin))?;
        // Manifest paths resolve relative to the origin's directory
        if !origin.path().ends_with('/') {
            let path = format!("{}/", origin.path());
            origin.set_path(&path);
        }

        let mut worker = WorkerConfig::new(
            GenerationId::new(self.version.as_str()),
            origin,
            PrecacheManifest::new(self.manifest.iter()),
        );
        worker.cache_miss = self.cache_miss;
        worker.activation = self.activation;
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overridden(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).cloned());
        config
    }

    #[test]
    fn test_defaults_match_deployment() {
        let config = Config::default();
        assert_eq!(config.version, "monie-v47");
        assert_eq!(config.manifest.len(), 16);
        assert_eq!(config.manifest[0], "./");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"version":"monie-v73","cache_miss":"no_response"}"#).unwrap();
        assert_eq!(config.version, "monie-v73");
        assert_eq!(config.cache_miss, CacheMissPolicy::NoResponse);
        assert_eq!(config.activation, ActivationPolicy::Immediate);
        assert_eq!(config.manifest.len(), 16);
    }

    #[test]
    fn test_env_overrides() {
        let config = overridden(&[
            ("MONIE_ORIGIN", "https://rates.example/app"),
            ("MONIE_VERSION", "monie-v48"),
            ("MONIE_NOTIFICATIONS", "false"),
        ]);
        assert_eq!(config.origin, "https://rates.example/app");
        assert_eq!(config.version, "monie-v48");
        assert!(!config.notifications_granted);

        let config = overridden(&[("MONIE_NOTIFICATIONS", "maybe")]);
        assert!(config.notifications_granted);
    }

    #[test]
    fn test_worker_config_resolves_under_origin_directory() {
        let mut config = Config::default();
        config.origin = "https://rates.example/app".to_string();
        let worker = config.worker_config().unwrap();

        assert_eq!(worker.origin.as_str(), "https://rates.example/app/");
        let urls = worker.manifest.resolve(&worker.origin).unwrap();
        assert_eq!(urls[1].as_str(), "https://rates.example/app/index.html");
        assert_eq!(worker.version, GenerationId::new("monie-v47"));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = std::env::temp_dir().join(format!("monie-config-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        assert_eq!(Config::load_from(&path).unwrap().version, "monie-v47");

        let mut config = Config::default();
        config.version = "monie-v73".to_string();
        config.activation = ActivationPolicy::WhenClientsReleased;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.version, "monie-v73");
        assert_eq!(loaded.activation, ActivationPolicy::WhenClientsReleased);
        assert_eq!(loaded.manifest, config.manifest);

        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_origin_is_reported() {
        let mut config = Config::default();
        config.origin = "not a url".to_string();
        assert!(config.worker_config().is_err());
    }
}

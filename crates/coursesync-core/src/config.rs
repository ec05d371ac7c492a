//! Client configuration management.
//!
//! Configuration is stored at `~/.config/coursesync/config.json`. Every
//! field has a default, so a missing or partial file is fine. The server
//! URL can be overridden with `COURSESYNC_SERVER_URL`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::api::client::Endpoints;
use crate::engine::EngineSettings;
use crate::offline::CacheNames;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "coursesync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Subdirectory of the store directory holding offline cache generations.
const OFFLINE_CACHE_DIR: &str = "offline";

/// Environment variable overriding `server_url`
pub const SERVER_URL_ENV: &str = "COURSESYNC_SERVER_URL";

const DEFAULT_MANIFEST: [&str; 12] = [
    "/",
    "/index.html",
    "/courses.html",
    "/internships.html",
    "/about.html",
    "/contact.html",
    "/css/style.css",
    "/css/enhanced-style.css",
    "/js/script.js",
    "/js/data.js",
    "/js/data-sync.js",
    "/js/cache-buster.js",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub api_path: String,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: Option<u64>,
    /// Poll the write marker so contexts in other processes see writes.
    pub marker_poll_ms: Option<u64>,
    pub offline_cache: bool,
    pub skip_waiting: bool,
    pub static_cache_name: String,
    pub data_cache_name: String,
    pub precache_manifest: Vec<String>,
    /// Also POST the full payload here on every write, for old servers.
    pub legacy_mirror_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            api_path: "/api".to_string(),
            sync_interval_secs: 30,
            request_timeout_secs: None,
            marker_poll_ms: Some(2000),
            offline_cache: true,
            skip_waiting: true,
            static_cache_name: "techinterns-v1".to_string(),
            data_cache_name: "techinterns-data-v1".to_string(),
            precache_manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
            legacy_mirror_path: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(std::env::var(SERVER_URL_ENV).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn apply_overrides(&mut self, server_url: Option<String>) {
        if let Some(url) = server_url.filter(|u| !u.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
    }

    /// Local store directory, one per server so origins never share data.
    pub fn store_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(self.origin_dir()?))
    }

    /// Where the offline cache keeps its generations, beside the store.
    pub fn offline_cache_dir(&self) -> Result<PathBuf> {
        Ok(self.store_dir()?.join(OFFLINE_CACHE_DIR))
    }

    fn origin_dir(&self) -> Result<String> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL {}", self.server_url))?;
        let host = url.host_str().unwrap_or("local");
        let origin = match url.port_or_known_default() {
            Some(port) => format!("{}_{}", host, port),
            None => host.to_string(),
        };
        Ok(origin
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect())
    }

    pub fn endpoints(&self) -> Result<Endpoints> {
        let endpoints = Endpoints::new(&self.server_url, &self.api_path)
            .with_context(|| format!("Invalid server URL {}", self.server_url))?;
        Ok(endpoints.with_legacy_mirror(self.legacy_mirror_path.clone()))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            marker_poll_interval: self.marker_poll_ms.map(Duration::from_millis),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn cache_names(&self) -> CacheNames {
        CacheNames::new(&self.static_cache_name, &self.data_cache_name)
    }

    /// Manifest entries resolved against the server URL.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        let base = Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL {}", self.server_url))?;
        self.precache_manifest
            .iter()
            .map(|path| {
                base.join(path)
                    .with_context(|| format!("Invalid manifest entry {}", path))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = Config::load_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.precache_manifest.len(), 12);
        assert_eq!(config.engine_settings().sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"server_url":"https://courses.example.com","sync_interval_secs":5}"#)
            .expect("write");

        let config = Config::load_from(&path).expect("load");
        assert_eq!(config.server_url, "https://courses.example.com");
        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.api_path, "/api");
        assert!(config.offline_cache);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            legacy_mirror_path: Some("/api/update-data-file".to_string()),
            ..Config::default()
        };
        config.save_to(&path).expect("save");
        assert_eq!(Config::load_from(&path).expect("load"), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").expect("write");
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_env_override_ignores_blank() {
        let mut config = Config::default();
        config.apply_overrides(Some("  ".to_string()));
        assert_eq!(config.server_url, "http://localhost:3000");
        config.apply_overrides(Some("http://10.0.0.2:8080".to_string()));
        assert_eq!(config.server_url, "http://10.0.0.2:8080");
    }

    #[test]
    fn test_origin_dir_is_filesystem_safe() {
        let config = Config {
            server_url: "https://courses.example.com".to_string(),
            ..Config::default()
        };
        assert_eq!(config.origin_dir().expect("origin"), "courses_example_com_443");
        assert_eq!(Config::default().origin_dir().expect("origin"), "localhost_3000");
    }

    #[test]
    fn test_offline_cache_lives_beside_store() {
        let config = Config::default();
        if let Ok(store_dir) = config.store_dir() {
            assert_eq!(
                config.offline_cache_dir().expect("offline dir"),
                store_dir.join("offline")
            );
        }
    }

    #[test]
    fn test_endpoints_and_manifest_resolve_against_server() {
        let config = Config::default();
        let endpoints = config.endpoints().expect("endpoints");
        assert_eq!(endpoints.data_path(), "/api/data");
        assert!(endpoints.legacy_mirror_url().is_none());

        let manifest = config.manifest_urls().expect("manifest");
        assert_eq!(manifest[0].as_str(), "http://localhost:3000/");
        assert_eq!(manifest[11].as_str(), "http://localhost:3000/js/cache-buster.js");
    }
}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheStore, FsCacheStore};
use crate::key::DEFAULT_MIN_SEASON;
use crate::registry::AbandonPolicy;
use crate::service::{ServiceOptions, TelemetryService};
use crate::session::retry::RetryConfig;
use crate::session::{
    DirectorySessionLoader, HttpSessionLoader, HttpSessionLoaderConfig, SessionLoader,
};

pub const CONFIG_FILENAME: &str = "racecast.toml";
const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
const APP_DIR: &str = "racecast";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub cache_dir: Option<PathBuf>,
    pub min_season: i32,
    pub abandon_policy: AbandonPolicy,
    pub default_frame_skip: u32,
    pub provider: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            cache_dir: None,
            min_season: DEFAULT_MIN_SEASON,
            abandon_policy: AbandonPolicy::Continue,
            default_frame_skip: 1,
            provider: ProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Keep raw provider responses under `<storage root>/raw`.
    pub raw_cache: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: None,
            source_dir: None,
            timeout_secs: 30,
            max_attempts: 3,
            raw_cache: true,
        }
    }
}

/// Command-line overrides. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub provider_url: Option<String>,
    pub source_dir: Option<PathBuf>,
}

impl Config {
    /// Reads `explicit` if given, else `racecast.toml` in the working
    /// directory when present, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => load_config_from_path(path),
            None if Path::new(CONFIG_FILENAME).exists() => load_config_from_path(CONFIG_FILENAME),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(dir) = overrides.cache_dir {
            self.cache_dir = Some(dir);
        }
        // An explicit source on the command line replaces both file settings.
        if overrides.provider_url.is_some() || overrides.source_dir.is_some() {
            self.provider.url = overrides.provider_url;
            self.provider.source_dir = overrides.source_dir;
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            min_season: self.min_season,
            default_frame_skip: self.default_frame_skip.max(1),
            abandon_policy: self.abandon_policy,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        resolve_storage_root(self.cache_dir.as_deref())
    }

    pub fn cache_store(&self, storage_root: &Path) -> FsCacheStore {
        FsCacheStore::new(storage_root.join("telemetry"))
    }

    pub fn session_loader(&self, storage_root: &Path) -> Result<Arc<dyn SessionLoader>> {
        if let Some(dir) = &self.provider.source_dir {
            info!(dir = %dir.display(), "reading sessions from directory");
            return Ok(Arc::new(DirectorySessionLoader::new(dir.clone())));
        }
        let Some(url) = &self.provider.url else {
            bail!(
                "No session provider configured.\n\n\
                Either:\n  \
                1. Pass --provider-url http://provider:9000 (or set RACECAST_PROVIDER_URL)\n  \
                2. Pass --source-dir ./sessions\n  \
                3. Set [provider] url or source_dir in {}",
                CONFIG_FILENAME
            );
        };

        let mut loader_config = HttpSessionLoaderConfig::new(url.clone());
        loader_config.timeout = Duration::from_secs(self.provider.timeout_secs.max(1));
        loader_config.retry = RetryConfig::exponential(self.provider.max_attempts.max(1), 250, 5_000);
        if self.provider.raw_cache {
            loader_config.raw_cache_dir = Some(storage_root.join("raw"));
        }
        info!(url = %url, "using HTTP session provider");
        let loader = HttpSessionLoader::new(loader_config).map_err(anyhow::Error::msg)?;
        Ok(Arc::new(loader))
    }

    pub fn build_service(&self) -> Result<Arc<TelemetryService>> {
        let root = self.storage_root();
        info!(root = %root.display(), "storage root resolved");
        let loader = self.session_loader(&root)?;
        let cache: Arc<dyn CacheStore> = Arc::new(self.cache_store(&root));
        Ok(TelemetryService::new(loader, cache, self.service_options()))
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    Ok(config)
}

fn is_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(format!(".write-check-{:016x}", rand::random::<u64>()));
    let ok = std::fs::write(&marker, b"").is_ok();
    let _ = std::fs::remove_file(&marker);
    ok
}

/// Picks the first writable of: `explicit`, the platform cache directory,
/// the system temp directory. The last is returned even if unwritable.
pub fn resolve_storage_root(explicit: Option<&Path>) -> PathBuf {
    let mut candidates = Vec::new();
    if let Some(dir) = explicit {
        candidates.push(dir.to_path_buf());
    }
    if let Some(dir) = dirs::cache_dir() {
        candidates.push(dir.join(APP_DIR));
    }

    for candidate in candidates {
        if is_writable(&candidate) {
            return candidate;
        }
        warn!(dir = %candidate.display(), "storage root not writable, falling back");
    }
    std::env::temp_dir().join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
listen = "127.0.0.1:9100"
cache_dir = "/var/cache/racecast"
min_season = 2019
abandon_policy = "cancel"
default_frame_skip = 5

[provider]
url = "http://localhost:9000"
timeout_secs = 10
max_attempts = 5
raw_cache = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9100");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/var/cache/racecast")));
        assert_eq!(config.min_season, 2019);
        assert_eq!(config.abandon_policy, AbandonPolicy::Cancel);
        assert_eq!(config.service_options().default_frame_skip, 5);
        assert_eq!(config.provider.url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.provider.max_attempts, 5);
        assert!(!config.provider.raw_cache);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.min_season, 2018);
        assert!(config.provider.raw_cache);
    }

    #[test]
    fn test_load_config_not_found() {
        let result = load_config_from_path("/nonexistent/racecast.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config: Config = toml::from_str(
            r#"
[provider]
url = "http://from-file:9000"
"#,
        )
        .unwrap();
        config.apply(Overrides {
            listen: Some("127.0.0.1:1".into()),
            source_dir: Some(PathBuf::from("./sessions")),
            ..Default::default()
        });
        assert_eq!(config.listen, "127.0.0.1:1");
        assert_eq!(config.provider.url, None);
        assert_eq!(config.provider.source_dir, Some(PathBuf::from("./sessions")));
    }

    #[test]
    fn test_missing_provider_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::default().session_loader(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_writable_root_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        assert_eq!(resolve_storage_root(Some(&root)), root);
        assert!(root.is_dir());
    }

    #[test]
    fn test_unwritable_root_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file cannot become a directory.
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let resolved = resolve_storage_root(Some(&blocker.join("sub")));
        assert_ne!(resolved, blocker.join("sub"));
    }
}

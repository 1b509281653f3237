use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::crawler::request::CrawlRequest;
use crate::crawler::scheduler::SchedulerSettings;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub crawler: CrawlerSettings,
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub renderer: RendererSettings,
}

/// Defaults applied to requests built from the command line
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    pub max_depth: u32,
    pub max_urls_per_level: usize,
    pub same_domain_only: bool,
    pub delay_ms: u64,
    /// Query parameters dropped during canonicalization, on top of the built-in list
    pub extra_tracking_params: Vec<String>,
}

/// Fetch concurrency per job
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GateSettings {
    pub max_in_flight: usize,
    pub acquire_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub job_ttl_secs: u64,
    pub page_ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

/// Shared state: cache, locks, job records, queue and progress
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: BackendKind,
    pub redis_url: String,
    pub job_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub queue_name: String,
    pub progress_channel: String,
}

/// External rendering service
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RendererSettings {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_urls_per_level: 10,
            same_domain_only: true,
            delay_ms: 1000,
            extra_tracking_params: vec![],
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            acquire_timeout_ms: 30_000,
            fetch_timeout_ms: 60_000,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            job_ttl_secs: 3600,
            page_ttl_secs: 7200,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            job_ttl_secs: 86_400,
            lock_ttl_secs: 600,
            queue_name: "deep_scrape_jobs".to_string(),
            progress_channel: "deep_scrape_progress".to_string(),
        }
    }
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            timeout_ms: 45_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings::default(),
            gate: GateSettings::default(),
            cache: CacheSettings::default(),
            storage: StorageSettings::default(),
            renderer: RendererSettings::default(),
        }
    }
}

impl GateSettings {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_in_flight: self.max_in_flight,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        }
    }
}

impl CrawlerSettings {
    /// A request for `url` carrying the configured defaults
    pub fn request_for(&self, url: &str) -> CrawlRequest {
        let mut request = CrawlRequest::new(url);
        request.max_depth = self.max_depth;
        request.max_urls_per_level = self.max_urls_per_level;
        request.same_domain_only = self.same_domain_only;
        request.delay_ms = self.delay_ms;
        request
    }
}

impl EngineConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "deep-scrape", "deep-scrape") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            config
        };

        Ok(config.with_env_overrides())
    }

    /// Load an explicit file, or the default one
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::load_from_file(path)?.with_env_overrides()),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// `REDIS_URL` and `RENDERER_URL` win over the file
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(std::env::var("REDIS_URL").ok(), std::env::var("RENDERER_URL").ok())
    }

    fn with_overrides(mut self, redis_url: Option<String>, renderer_url: Option<String>) -> Self {
        if let Some(url) = redis_url.filter(|url| !url.trim().is_empty()) {
            self.storage.redis_url = url;
        }
        if let Some(url) = renderer_url.filter(|url| !url.trim().is_empty()) {
            self.renderer.url = url;
        }
        self
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    pub fn job_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.job_ttl_secs)
    }

    pub fn page_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.page_ttl_secs)
    }

    pub fn job_record_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.job_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.lock_ttl_secs)
    }

    pub fn renderer_timeout(&self) -> Duration {
        Duration::from_millis(self.renderer.timeout_ms)
    }
}

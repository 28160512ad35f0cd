use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::scoring::{PriorityWeights, DEFAULT_WEIGHT_COUNT, DEFAULT_WEIGHT_SEVERITY};

/// Deployment configuration loaded from environment variables.
/// Tunables for clustering and listing live in the TOML [`FileConfig`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` runs against the in-memory store.
    pub database_url: Option<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let web_port = env::var("WEB_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("WEB_PORT must be a number")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port,
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// TOML-backed tunables. Every field has a default so partial files are valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub clustering: ClusteringConfig,
    pub listing: ListingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusteringConfig {
    /// Reports within this distance of an open cluster's centroid join it.
    pub radius_meters: f64,
    pub weight_count: f64,
    pub weight_severity: f64,
    /// Merge attempts after an optimistic-version conflict before giving up.
    pub max_conflict_retries: u32,
    /// Base delay before re-running a lost assignment or status change.
    /// Doubles per retry, plus up to one base of jitter.
    pub conflict_retry_base_ms: u64,
    /// Per-call deadline for store I/O.
    pub store_timeout_ms: u64,
    /// Re-check for a candidate inside the store's critical section before
    /// creating, so simultaneous first reports land in one cluster.
    pub serialize_creates: bool,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            radius_meters: 50.0,
            weight_count: DEFAULT_WEIGHT_COUNT,
            weight_severity: DEFAULT_WEIGHT_SEVERITY,
            max_conflict_retries: 5,
            conflict_retry_base_ms: 10,
            store_timeout_ms: 2_000,
            serialize_creates: false,
        }
    }
}

impl ClusteringConfig {
    pub fn weights(&self) -> PriorityWeights {
        PriorityWeights {
            count: self.weight_count,
            severity: self.weight_severity,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn conflict_retry_base(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListingConfig {
    pub max_page_size: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self { max_page_size: 100 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(FileConfig::default());
    }
    load_config(path)
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        let c = &self.clustering;
        if !(c.radius_meters.is_finite() && c.radius_meters > 0.0) {
            anyhow::bail!("clustering.radius_meters must be a positive number");
        }
        if !(c.weight_count.is_finite() && c.weight_severity.is_finite()) {
            anyhow::bail!("clustering weights must be finite");
        }
        if c.store_timeout_ms == 0 {
            anyhow::bail!("clustering.store_timeout_ms must be greater than zero");
        }
        if c.conflict_retry_base_ms >= c.store_timeout_ms {
            anyhow::bail!("clustering.conflict_retry_base_ms must be below store_timeout_ms");
        }
        if self.listing.max_page_size == 0 {
            anyhow::bail!("listing.max_page_size must be greater than zero");
        }
        Ok(())
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub feed: Feed,
    pub fetch: Fetch,
    pub ingest: Ingest,
    #[serde(default)]
    pub schedule: Schedule,
    pub observability: Observability,
    pub web: Option<Web>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

/// Upstream leaderboard feed.
#[derive(Debug, Clone, Deserialize)]
pub struct Feed {
    pub base_url: String,
    pub page_size: u64,
    pub timeout_secs: u64,
    /// Transport-level retries (connect errors, timeouts, 429, 5xx).
    pub http_max_retries: u32,
    pub http_backoff_base_ms: u64,
    /// Logic-level retries (malformed or empty payload).
    pub logic_max_retries: u32,
    pub logic_backoff_base_ms: u64,
    pub user_agent: String,
    /// Feed-specific filters appended to every page request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Feed {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn http_backoff_base(&self) -> Duration {
        Duration::from_millis(self.http_backoff_base_ms)
    }

    pub fn logic_backoff_base(&self) -> Duration {
        Duration::from_millis(self.logic_backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fetch {
    pub data_dir: String,
    pub window_pages: u64,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingest {
    pub base_batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub tvl_ceiling: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub interval_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Web {
    pub port: u16,
    pub host: String,
}

impl Config {
    /// Load from `LEADERBOARD_CONFIG` if set, otherwise `config/default.toml`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("LEADERBOARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.feed.page_size > 0, "feed.page_size must be > 0");
        anyhow::ensure!(
            self.feed.logic_max_retries > 0,
            "feed.logic_max_retries must be > 0"
        );
        anyhow::ensure!(self.fetch.window_pages > 0, "fetch.window_pages must be > 0");
        anyhow::ensure!(self.fetch.max_workers > 0, "fetch.max_workers must be > 0");
        anyhow::ensure!(
            self.ingest.base_batch_size > 0,
            "ingest.base_batch_size must be > 0"
        );
        anyhow::ensure!(self.ingest.max_retries > 0, "ingest.max_retries must be > 0");
        anyhow::ensure!(
            self.ingest.tvl_ceiling.is_finite() && self.ingest.tvl_ceiling > 0.0,
            "ingest.tvl_ceiling must be a positive finite number"
        );
        anyhow::ensure!(
            self.schedule.interval_secs > 0,
            "schedule.interval_secs must be > 0"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

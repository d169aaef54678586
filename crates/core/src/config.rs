use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "CI_INSIGHTS_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub db: DbConfig,
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

impl Config {
    /// Load the config from `CI_INSIGHTS_CONFIG`, falling back to `config.yml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.yml"));
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
    pub jobs_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabConfig {
    pub url: Url,
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub retry_attempts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self { Self { concurrency: 8, retry_attempts: 5 } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Artifact archives are downloaded only when strictly smaller than this.
    pub max_artifact_size: u64,
    pub commit_history_limit: usize,
    pub recalculate_interval_secs: u64,
    pub dedup_ttl_secs: u64,
    pub message_preview_length: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_artifact_size: 500 * 1024 * 1024,
            commit_history_limit: 200,
            recalculate_interval_secs: 60 * 60,
            dedup_ttl_secs: 24 * 60 * 60,
            message_preview_length: 100,
        }
    }
}

impl ProcessingConfig {
    pub fn recalculate_interval(&self) -> Duration {
        Duration::from_secs(self.recalculate_interval_secs)
    }

    pub fn dedup_ttl(&self) -> Duration { Duration::from_secs(self.dedup_ttl_secs) }
}

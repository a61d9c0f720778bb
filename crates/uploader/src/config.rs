//! Uploader configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chunkferry/config.toml`
//! - Windows: `%APPDATA%/chunkferry/config.toml`
//!
//! Every field has a default, so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Base URL of the remote service.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Chunk transfers in flight per transfer.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts per chunk before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Hash worker threads.
    #[serde(default = "chunkferry_hasher::default_worker_count")]
    pub worker_count: usize,

    /// Resume record file.
    #[serde(default = "default_resume_path")]
    pub resume_path: PathBuf,
}

fn default_api_base() -> String {
    "http://127.0.0.1:8080/minio".into()
}

fn default_chunk_size() -> u64 {
    chunkferry_transfer::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_resume_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chunkferry")
        .join("resume.json")
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            worker_count: chunkferry_hasher::default_worker_count(),
            resume_path: default_resume_path(),
        }
    }
}

impl UploadConfig {
    /// Loads the config from the default path, writing defaults on first run.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_or_create(&path)
    }

    /// Loads the config at `path`, writing defaults there if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: UploadConfig = toml::from_str(&content)?;
            config.validate()?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = UploadConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the config to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects values the uploader cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Returns the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("chunkferry").join("config.toml"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

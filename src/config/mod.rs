//! Scanner Configuration
//!
//! Remote service, matching and runtime settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scanner settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Remote service settings
    pub api: ApiSettings,
    /// On-device matching settings
    pub matching: MatchingSettings,
    /// Worker and notification settings
    pub runtime: RuntimeSettings,
}

/// Remote signature and search service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL, without a trailing slash
    pub base_url: String,
    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Minimum acceptable body throughput in bytes per second
    pub low_speed_limit: u64,
    /// How long throughput may stay below the limit, in seconds
    pub low_speed_time_secs: u64,
    /// Signatures fetched per sync batch
    pub sync_batch_size: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.scanner.example.com".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            low_speed_limit: 512,
            low_speed_time_secs: 15,
            sync_batch_size: 50,
        }
    }
}

impl ApiSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn low_speed_time(&self) -> Duration {
        Duration::from_secs(self.low_speed_time_secs)
    }
}

/// Image matching thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Minimum NCC score for a full match
    pub acceptance_threshold: f32,
    /// Minimum NCC score for a half-region match
    pub partial_threshold: f32,
    /// Score window within which competing partial matches are ambiguous
    pub ambiguity_margin: f32,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.80,
            partial_threshold: 0.92,
            ambiguity_margin: 0.02,
        }
    }
}

/// Threading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Background worker threads for sync and server search
    pub worker_threads: usize,
    /// Deliver notifications on a dedicated thread (false: host pumps them)
    pub notification_thread: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            notification_thread: true,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<ScannerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: ScannerConfig = toml::from_str(&content).context("Invalid config file")?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &ScannerConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

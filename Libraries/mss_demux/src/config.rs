use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Tunables of the demuxer and its fetch loops.
///
/// Every field has a default, so a JSON document only needs the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Network connection speed in bits per second, 0 when unknown.
    pub connection_speed: u64,
    /// Share of the measured download rate usable when picking a quality level.
    pub bitrate_limit: f32,
    /// Let measured download rates lower the quality ceiling.
    pub adaptive_bitrate: bool,
    /// Number of download samples averaged per stream.
    pub download_rate_history: usize,
    /// Consecutive fragment download failures tolerated before giving up on a stream.
    pub max_download_errors: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Pause between live manifest reloads that bring nothing new.
    pub manifest_reload_interval_ms: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            connection_speed: 0,
            bitrate_limit: 0.8,
            adaptive_bitrate: false,
            download_rate_history: 5,
            max_download_errors: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            manifest_reload_interval_ms: 2_000,
        }
    }
}

impl DemuxConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: DemuxConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.bitrate_limit > 0.0 && self.bitrate_limit <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "bitrate_limit must be within (0, 1], got {}",
                self.bitrate_limit
            )));
        }
        if self.download_rate_history == 0 {
            return Err(ConfigError::Invalid("download_rate_history must be positive".to_string()));
        }
        if self.max_download_errors == 0 {
            return Err(ConfigError::Invalid("max_download_errors must be positive".to_string()));
        }
        Ok(())
    }

    /// Delay before retrying after `failures` consecutive download errors.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn manifest_reload_interval(&self) -> Duration {
        Duration::from_millis(self.manifest_reload_interval_ms)
    }
}

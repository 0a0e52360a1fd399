//! Rollout Configuration - network server, fleet, firmware store and protocol timing
//!
//! Every protocol constant is a field here. Each struct implements `Default`
//! with values from [`super::defaults`], so a config file only needs the
//! deployment-specific parts (server URL, API key, device list).

use super::defaults;
use crate::network::RetryPolicy;
use crate::types::DevEui;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "LORA_FOTA_CONFIG";
/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "rollout.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Network server REST API and radio parameters
    #[serde(default)]
    pub network_server: NetworkServerConfig,

    /// Devices taking part in the rollout
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Versioned firmware store
    #[serde(default)]
    pub firmware: FirmwareConfig,

    /// Protocol pacing and liveness timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Multicast framing parameters
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Retry policy for idempotent network server reads
    #[serde(default)]
    pub retry: RetryConfig,

    /// Uplink HTTP integration endpoint
    #[serde(default)]
    pub integration: IntegrationConfig,
}

impl RolloutConfig {
    /// Load configuration using the standard search order, apply
    /// environment overrides and validate.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::resolve_path(explicit_path) {
            Some(path) => {
                let config = Self::load_from_file(&path)?;
                info!(path = %path.display(), "Loaded rollout config");
                config
            }
            None => {
                info!("No rollout.toml found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit_path {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        local.exists().then_some(local)
    }

    /// Parse a TOML file without overrides or validation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Apply `LORA_FOTA_*` overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("LORA_FOTA_API_KEY") {
            self.network_server.api_key = key;
        }
        if let Some(url) = lookup("LORA_FOTA_SERVER_URL") {
            self.network_server.url = url;
        }
        if let Some(app) = lookup("LORA_FOTA_APP_ID") {
            self.network_server.application_id = app;
        }
        if let Some(list) = lookup("LORA_FOTA_DEVICE_EUI") {
            let parsed = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<DevEui>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Validation(vec![e.to_string()]))?;
            self.devices.eui = parsed;
        }
        Ok(())
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configuration as a whole.
    ///
    /// Every problem is collected so operators fix them in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.network_server.url.trim().is_empty() {
            errors.push("network_server.url must be set".to_string());
        }
        if self.network_server.api_key.trim().is_empty() {
            errors.push("network_server.api_key must be set".to_string());
        }
        if self.network_server.application_id.trim().is_empty() {
            errors.push("network_server.application_id must be set".to_string());
        }
        if self.devices.eui.is_empty() {
            errors.push("devices.eui must list at least one device".to_string());
        }
        let unique: BTreeSet<&DevEui> = self.devices.eui.iter().collect();
        if unique.len() != self.devices.eui.len() {
            errors.push("devices.eui contains duplicate entries".to_string());
        }

        if self.delivery.chunk_size == 0 {
            errors.push("delivery.chunk_size must be > 0".to_string());
        }
        if self.delivery.manifest_repeats == 0 {
            errors.push("delivery.manifest_repeats must be > 0".to_string());
        }
        if self.integration.channel_capacity == 0 {
            errors.push("integration.channel_capacity must be > 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(format!(
                "retry.base_delay_ms ({}) must be <= retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }

        let t = &self.timing;
        if t.version_query_interval_secs == 0 {
            errors.push("timing.version_query_interval_secs must be > 0".to_string());
        }
        if t.queue_poll_interval_secs == 0 {
            errors.push("timing.queue_poll_interval_secs must be > 0".to_string());
        }
        let longest_pacing = t
            .version_query_interval_secs
            .max(t.key_pacing_secs)
            .max(t.frame_pacing_secs)
            .max(t.settle_delay_secs);
        if t.watchdog_timeout_secs <= longest_pacing {
            errors.push(format!(
                "timing.watchdog_timeout_secs ({}) must exceed the longest pacing interval ({longest_pacing})",
                t.watchdog_timeout_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Network server (ChirpStack) connection and radio parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkServerConfig {
    /// Base URL of the REST API, e.g. `http://chirpstack:8090`
    pub url: String,
    /// Bearer API key
    pub api_key: String,
    /// Application the devices and multicast group belong to
    pub application_id: String,
    /// Multicast downlink datarate
    pub downlink_datarate: u32,
    /// Multicast downlink frequency (Hz)
    pub downlink_frequency_hz: u64,
    /// REST request timeout (seconds)
    pub http_timeout_secs: u64,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            application_id: String::new(),
            downlink_datarate: defaults::DOWNLINK_DATARATE,
            downlink_frequency_hz: defaults::DOWNLINK_FREQUENCY_HZ,
            http_timeout_secs: defaults::HTTP_TIMEOUT_SECS,
        }
    }
}

/// Devices taking part in the rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub eui: Vec<DevEui>,
}

/// Firmware store layout and diff classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Root directory holding one sub-directory per version
    pub store_dir: PathBuf,
    /// File names excluded from diffs wherever they appear
    pub ignore: Vec<String>,
    /// Extensions (with leading dot) that are replaced, never diffed
    pub binary_extensions: Vec<String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(defaults::FIRMWARE_DIR),
            ignore: defaults::IGNORED_FILES.iter().map(|s| (*s).to_string()).collect(),
            binary_extensions: defaults::BINARY_EXTENSIONS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Protocol timing. Pacing values model downlink airtime budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub version_query_interval_secs: u64,
    pub key_pacing_secs: u64,
    pub frame_pacing_secs: u64,
    pub queue_poll_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub watchdog_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            version_query_interval_secs: defaults::VERSION_QUERY_INTERVAL_SECS,
            key_pacing_secs: defaults::KEY_PACING_SECS,
            frame_pacing_secs: defaults::FRAME_PACING_SECS,
            queue_poll_interval_secs: defaults::QUEUE_POLL_INTERVAL_SECS,
            settle_delay_secs: defaults::SETTLE_DELAY_SECS,
            watchdog_timeout_secs: defaults::WATCHDOG_TIMEOUT_SECS,
        }
    }
}

impl TimingConfig {
    pub fn version_query_interval(&self) -> Duration {
        Duration::from_secs(self.version_query_interval_secs)
    }

    pub fn key_pacing(&self) -> Duration {
        Duration::from_secs(self.key_pacing_secs)
    }

    pub fn frame_pacing(&self) -> Duration {
        Duration::from_secs(self.frame_pacing_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_secs(self.queue_poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }
}

/// Multicast framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Compressed patch bytes per PATCH frame
    pub chunk_size: usize,
    /// Manifest broadcasts after the file operations
    pub manifest_repeats: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::PATCH_CHUNK_SIZE,
            manifest_repeats: defaults::MANIFEST_REPEATS,
        }
    }
}

/// Bounded retry for idempotent reads (queue length, group fetch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Uplink HTTP integration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub listen_addr: String,
    pub channel_capacity: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            listen_addr: defaults::INTEGRATION_LISTEN_ADDR.to_string(),
            channel_capacity: defaults::UPLINK_CHANNEL_CAPACITY,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

//! Lab provisioning configuration

use crate::container::ResourceLimits;
use crate::error::{LabError, Result};
use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};

/// Default instance lifetime for time-limited labs: 4 hours
pub const DEFAULT_LIFETIME_SECS: u64 = 4 * 60 * 60;

/// Longest accepted instance lifetime: one year
pub const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Default isolation network
pub const DEFAULT_NETWORK: &str = "ctf-network";

/// Image used when a lab names none
pub const DEFAULT_BASE_IMAGE: &str = "ctf/base:latest";

/// Sentinel returned when instance logs cannot be read
pub const LOGS_NOT_AVAILABLE: &str = "Logs not available";

/// Settings applied to every provisioned instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Memory ceiling per container, in bytes. YAML also accepts `512m`.
    #[serde(deserialize_with = "memory_size")]
    pub memory_limit: u64,
    /// CPU quota per container (microseconds per 100ms period)
    pub cpu_quota: i64,
    /// Lifetime of instances of time-limited labs, in seconds
    pub lifetime_secs: u64,
    /// Network instances join when it exists
    pub network: String,
    /// Image for labs without one
    pub base_image: String,
    /// Default number of log lines returned
    pub log_tail: usize,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            memory_limit: 512 * 1024 * 1024,
            cpu_quota: 50000,
            lifetime_secs: DEFAULT_LIFETIME_SECS,
            network: DEFAULT_NETWORK.to_string(),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            log_tail: 100,
        }
    }
}

impl LabConfig {
    /// Instance lifetime window
    pub fn lifetime(&self) -> Duration {
        Duration::seconds(self.lifetime_secs.min(MAX_LIFETIME_SECS) as i64)
    }

    /// Resource limits for one instance container
    pub fn resources(&self) -> ResourceLimits {
        ResourceLimits {
            memory_limit: Some(self.memory_limit),
            cpu_quota: Some(self.cpu_quota),
            cpu_period: None,
        }
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit < 4 * 1024 * 1024 {
            return Err(LabError::InvalidConfig(format!(
                "memory_limit {} is below the 4MiB engine minimum",
                self.memory_limit
            )));
        }
        if self.cpu_quota != -1 && self.cpu_quota < 1000 {
            return Err(LabError::InvalidConfig(format!(
                "cpu_quota {} must be -1 or at least 1000",
                self.cpu_quota
            )));
        }
        if self.lifetime_secs == 0 || self.lifetime_secs > MAX_LIFETIME_SECS {
            return Err(LabError::InvalidConfig(format!(
                "lifetime_secs must be between 1 and {}",
                MAX_LIFETIME_SECS
            )));
        }
        if self.base_image.trim().is_empty() {
            return Err(LabError::InvalidConfig("base_image is empty".to_string()));
        }
        Ok(())
    }
}

/// Parse a memory size such as `512m`, `1g` or `268435456`
pub fn parse_memory(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);

    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| LabError::InvalidConfig(format!("Invalid memory size: {}", value)))
}

fn memory_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_memory(&text).map_err(serde::de::Error::custom),
    }
}

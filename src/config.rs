use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub deferred: DeferredConfig,

    /// Grace period given to running handlers on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(default = "default_fault_channel_capacity")]
    pub fault_channel_capacity: usize,

    /// Emit `system.agent.registered` / `system.agent.unregistered`.
    #[serde(default = "default_true")]
    pub lifecycle_events: bool,

    /// Source recorded on events emitted without an explicit one.
    #[serde(default = "default_source")]
    pub default_source: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            fault_channel_capacity: default_fault_channel_capacity(),
            lifecycle_events: default_true(),
            default_source: default_source(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_fault_channel_capacity() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_source() -> String {
    "anonymous".to_string()
}
fn default_max_pending() -> usize {
    100_000
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            deferred: DeferredConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.deferred.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "deferred.max_pending must be at least 1".to_string(),
            ));
        }
        if self.bus.fault_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus.fault_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

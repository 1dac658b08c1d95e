use crate::fault_injection::FaultInjectionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// Primary handshake retransmission window; randomised to desynchronise peers.
const DEFAULT_HANDSHAKE_INTERVAL_MIN_US: u64 = 3_000;
const DEFAULT_HANDSHAKE_INTERVAL_MAX_US: u64 = 10_000;
const DEFAULT_READ_CHUNK: usize = 256;
const MAX_HANDSHAKE_INTERVAL_US: u64 = 60_000_000;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;
const DEFAULT_DURATION_MS: u64 = 2_000;
const DEFAULT_PACKET_INTERVAL_MS: u64 = 10;
const DEFAULT_PACKET_SIZE: usize = 500;
const DEFAULT_PIPE_CAPACITY: usize = 4096;
// Virtual time is i64 nanoseconds; a year per run leaves ample headroom.
const MAX_SPAN_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-link protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LinkConfig {
    pub handshake_interval_min_us: u64,
    pub handshake_interval_max_us: u64,
    /// Bytes pulled from the wire per read attempt.
    pub read_chunk: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_interval_min_us: DEFAULT_HANDSHAKE_INTERVAL_MIN_US,
            handshake_interval_max_us: DEFAULT_HANDSHAKE_INTERVAL_MAX_US,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl LinkConfig {
    pub fn handshake_interval_min(&self) -> Duration {
        Duration::from_micros(self.handshake_interval_min_us)
    }

    pub fn handshake_interval_max(&self) -> Duration {
        Duration::from_micros(self.handshake_interval_max_us)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_interval_min_us == 0 {
            return Err(ConfigError::Invalid("handshake_interval_min_us must be positive".into()));
        }
        if self.handshake_interval_min_us >= self.handshake_interval_max_us {
            return Err(ConfigError::Invalid(format!(
                "handshake interval window is empty: [{}us, {}us)",
                self.handshake_interval_min_us, self.handshake_interval_max_us
            )));
        }
        if self.handshake_interval_max_us > MAX_HANDSHAKE_INTERVAL_US {
            return Err(ConfigError::Invalid(format!(
                "handshake_interval_max_us exceeds {}us",
                MAX_HANDSHAKE_INTERVAL_US
            )));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("read_chunk must be positive".into()));
        }
        Ok(())
    }
}

/// Whole-run configuration for the two-endpoint testbed and the `fwsim` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    pub seed: u64,
    pub duration_ms: u64,
    /// Gap between offered packets on each side; 0 disables traffic.
    pub packet_interval_ms: u64,
    pub packet_size: usize,
    pub pipe_capacity: usize,
    pub link: LinkConfig,
    pub faults: FaultInjectionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            duration_ms: DEFAULT_DURATION_MS,
            packet_interval_ms: DEFAULT_PACKET_INTERVAL_MS,
            packet_size: DEFAULT_PACKET_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            link: LinkConfig::default(),
            faults: FaultInjectionConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.faults
            .validate()
            .map_err(|reason| ConfigError::Invalid(reason.to_string()))?;
        if self.pipe_capacity == 0 {
            return Err(ConfigError::Invalid("pipe_capacity must be positive".into()));
        }
        if self.packet_size == 0 {
            return Err(ConfigError::Invalid("packet_size must be positive".into()));
        }
        if self.duration_ms > MAX_SPAN_MS {
            return Err(ConfigError::Invalid(format!("duration_ms exceeds {}ms", MAX_SPAN_MS)));
        }
        if self.packet_interval_ms > MAX_SPAN_MS {
            return Err(ConfigError::Invalid(format!(
                "packet_interval_ms exceeds {}ms",
                MAX_SPAN_MS
            )));
        }
        Ok(())
    }
}

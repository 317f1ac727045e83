//! Configuration loading for the RTDE client

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::transport::RTDE_PORT;
use crate::{Result, RtdeError};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub robot: RobotConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Output update frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

/// Timing of the state synchronizer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_state_timeout_ms")]
    pub state_timeout_ms: u64,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_ack_attempts")]
    pub ack_attempts: u32,
    #[serde(default = "default_ack_interval_ms")]
    pub ack_interval_ms: u64,
    #[serde(default = "default_receive_retry_delay_ms")]
    pub receive_retry_delay_ms: u64,
    #[serde(default)]
    pub reference_tracking: bool,
}

fn default_port() -> u16 {
    RTDE_PORT
}

fn default_frequency() -> f64 {
    125.0
}

fn default_nodelay() -> bool {
    true
}

fn default_state_timeout_ms() -> u64 {
    100
}

fn default_start_timeout_ms() -> u64 {
    100
}

fn default_ack_attempts() -> u32 {
    25
}

fn default_ack_interval_ms() -> u64 {
    4
}

fn default_receive_retry_delay_ms() -> u64 {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_timeout_ms: default_state_timeout_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            ack_attempts: default_ack_attempts(),
            ack_interval_ms: default_ack_interval_ms(),
            receive_retry_delay_ms: default_receive_retry_delay_ms(),
            reference_tracking: false,
        }
    }
}

impl SyncConfig {
    /// How long `state(true)` waits for a fresh snapshot
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    /// How long `start()` waits for the first snapshot
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn receive_retry_delay(&self) -> Duration {
        Duration::from_millis(self.receive_retry_delay_ms)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| RtdeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for `host` with every other value at its default
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            robot: RobotConfig {
                host: host.into(),
                port: default_port(),
                frequency: default_frequency(),
                nodelay: default_nodelay(),
            },
            sync: SyncConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(RtdeError::Config("robot.host must not be empty".to_string()));
        }
        if !(1.0..=125.0).contains(&self.robot.frequency) {
            return Err(RtdeError::Config(format!(
                "robot.frequency must be within 1..=125 Hz, got {}",
                self.robot.frequency
            )));
        }
        Ok(())
    }
}

//! Runtime configuration.
//!
//! Every section deserializes with defaults, so an empty document yields a
//! working configuration. Durations are plain millisecond integers (`*_ms`)
//! and are exposed as [`Duration`] through accessor methods.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::BackoffPolicy;

/// Configuration validation error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub broadcast: BroadcastConfig,
    pub shutdown: ShutdownConfig,
}

impl RuntimeConfig {
    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        if self.health.interval_ms == 0 {
            return Err(ConfigError::invalid("health.interval_ms", "must be > 0"));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "health.probe_timeout_ms",
                "must be > 0",
            ));
        }
        if self.broadcast.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "broadcast.queue_capacity",
                "must be > 0",
            ));
        }
        if self.shutdown.timeout_ms == 0 {
            return Err(ConfigError::invalid("shutdown.timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Settings for the supervised monitor worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// When false the supervisor service is not registered at all.
    pub enabled: bool,
    /// When true a worker that fails to start aborts initialization.
    pub required: bool,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub command_timeout_ms: u64,
    /// Silence longer than this marks a running worker unhealthy. `0` disables.
    pub heartbeat_timeout_ms: u64,
    pub restart: RestartConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            program: "python3".to_owned(),
            args: vec!["-u".to_owned(), "main.py".to_owned()],
            env: BTreeMap::new(),
            working_directory: None,
            startup_timeout_ms: 15_000,
            stop_grace_ms: 5_000,
            command_timeout_ms: 10_000,
            heartbeat_timeout_ms: 90_000,
            restart: RestartConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.program.trim().is_empty() {
            return Err(ConfigError::invalid(
                "worker.program",
                "must not be empty when the worker is enabled",
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "worker.startup_timeout_ms",
                "must be > 0",
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "worker.command_timeout_ms",
                "must be > 0",
            ));
        }
        self.restart.validate()
    }
}

/// Restart budget and backoff for a crashing worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive crashes tolerated before the worker is marked failed.
    pub max_restarts: u32,
    /// Uptime after which the consecutive crash counter is reset.
    pub stable_after_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_restarts: 5,
            stable_after_ms: 60_000,
        }
    }
}

impl RestartConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "worker.restart.max_delay_ms",
                format!("must be >= base_delay_ms ({})", self.base_delay_ms),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BroadcastConfig {
    /// Default bound of every subscriber queue.
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Overall deadline for stopping every service.
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

//! Run requests and engine tuning.

use crate::error::ConfigError;
use crate::model::Credential;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// A request to execute a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub ccu: usize,
    pub threads: usize,
    /// Seconds.
    pub duration: u64,
    /// Seconds.
    #[serde(default)]
    pub ramp_up_time: u64,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl RunConfig {
    pub fn validate(&self, limits: &RunLimits) -> Result<(), ConfigError> {
        if self.ccu < 1 {
            return Err(ConfigError::InvalidCcu(self.ccu));
        }
        if self.threads < limits.min_threads || self.threads > limits.max_threads {
            return Err(ConfigError::InvalidThreads {
                got: self.threads,
                min: limits.min_threads,
                max: limits.max_threads,
            });
        }
        if self.duration < limits.min_duration_secs {
            return Err(ConfigError::InvalidDuration {
                got: self.duration,
                min: limits.min_duration_secs,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLimits {
    pub min_duration_secs: u64,
    pub min_threads: usize,
    pub max_threads: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            min_duration_secs: 30,
            min_threads: 1,
            max_threads: 6,
        }
    }
}

/// Idle time between two passes of a flow: `base + rand[0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    pub base_ms: u64,
    pub jitter_ms: u64,
}

impl ThinkTime {
    pub const FAST: ThinkTime = ThinkTime {
        base_ms: 90,
        jitter_ms: 40,
    };

    pub const HUMAN: ThinkTime = ThinkTime {
        base_ms: 3000,
        jitter_ms: 4000,
    };

    pub fn sample(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.base_ms + jitter)
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::FAST
    }
}

/// Whether requests cut off by the deadline show up in a worker's totals.
/// They are never emitted as log records either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortedRequestPolicy {
    #[default]
    Discard,
    CountAsError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub think_time: ThinkTime,
    pub request_timeout_ms: u64,
    pub grace_period_ms: u64,
    /// Status recorded for requests that never got an HTTP response.
    pub transport_error_status: u16,
    pub aborted_requests: AbortedRequestPolicy,
    pub sink_batch_size: usize,
    pub sink_flush_interval_ms: u64,
    pub channel_capacity: usize,
    pub credential_wait_ms: u64,
    pub credential_attempts: u32,
    pub limits: RunLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            think_time: ThinkTime::default(),
            request_timeout_ms: 30_000,
            grace_period_ms: 5_000,
            transport_error_status: 500,
            aborted_requests: AbortedRequestPolicy::default(),
            sink_batch_size: 100,
            sink_flush_interval_ms: 5_000,
            channel_capacity: 1024,
            credential_wait_ms: 50,
            credential_attempts: 20,
            limits: RunLimits::default(),
        }
    }
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn sink_flush_interval(&self) -> Duration {
        Duration::from_millis(self.sink_flush_interval_ms.max(1))
    }

    pub fn credential_wait(&self) -> Duration {
        Duration::from_millis(self.credential_wait_ms)
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Partially given fields fall back to the defaults of [`DeliveryConfig`],
/// per policy, so `"delivery": { "base_backoff_ms": 10 }` keeps five attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DeliveryConfigFile")]
pub struct DeliveryConfig {
    /// Retries around the target's create-TID call.
    pub allocation: RetryPolicy,
    /// Transmissions of one attempt (first send plus idempotent resends).
    pub delivery: RetryPolicy,
    /// Retries around commit and rollback calls.
    pub commit: RetryPolicy,
    /// Upper bound on waiting for an acknowledgement; `None` waits forever.
    pub ack_timeout_ms: Option<u64>,
    /// Active records idle longer than this are expired.
    pub idle_timeout_ms: u64,
    /// Capacity of the recently-finalized ledgers.
    pub recent_outcomes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            allocation: RetryPolicy::default(),
            delivery: RetryPolicy::default().with_max_attempts(5),
            commit: RetryPolicy::default(),
            ack_timeout_ms: None,
            idle_timeout_ms: 10 * 60 * 1000,
            recent_outcomes: 1_024,
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct PolicyOverrides {
    max_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

impl PolicyOverrides {
    fn over(self, base: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_backoff_ms: self.base_backoff_ms.unwrap_or(base.base_backoff_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(base.max_backoff_ms),
            jitter_ms: self.jitter_ms.unwrap_or(base.jitter_ms),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct DeliveryConfigFile {
    allocation: PolicyOverrides,
    delivery: PolicyOverrides,
    commit: PolicyOverrides,
    ack_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    recent_outcomes: Option<usize>,
}

impl From<DeliveryConfigFile> for DeliveryConfig {
    fn from(file: DeliveryConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            allocation: file.allocation.over(defaults.allocation),
            delivery: file.delivery.over(defaults.delivery),
            commit: file.commit.over(defaults.commit),
            ack_timeout_ms: file.ack_timeout_ms.or(defaults.ack_timeout_ms),
            idle_timeout_ms: file.idle_timeout_ms.unwrap_or(defaults.idle_timeout_ms),
            recent_outcomes: file.recent_outcomes.unwrap_or(defaults.recent_outcomes),
        }
    }
}

impl DeliveryConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.allocation.validate("allocation")?;
        self.delivery.validate("delivery")?;
        self.commit.validate("commit")?;

        if self.ack_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "ack_timeout_ms",
                reason: "must be > 0 when set".into(),
            });
        }
        if self.idle_timeout_ms < 1_000 {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_ms",
                reason: "should be at least 1000ms".into(),
            });
        }
        if self.recent_outcomes == 0 {
            return Err(ConfigError::Invalid {
                field: "recent_outcomes",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }
}

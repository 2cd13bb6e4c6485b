use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;

/// Bounded exponential backoff. `max_attempts` counts every try, the first
/// one included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            jitter_ms: 50,
        }
    }
}

impl RetryPolicy {
    const MAX_EXPONENT: u32 = 16;

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// A policy that retries immediately; meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_ms: 0,
        }
    }

    pub fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: name,
                reason: "max_attempts must be > 0".into(),
            });
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: name,
                reason: format!(
                    "base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                    self.base_backoff_ms, self.max_backoff_ms
                ),
            });
        }
        Ok(())
    }

    /// Whether another try is allowed after `attempts_made` tries.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the try following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(Self::MAX_EXPONENT);
        let base_delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        let capped_delay = base_delay.min(self.max_backoff_ms);

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };

        Duration::from_millis(capped_delay.saturating_add(jitter))
    }
}

//! Linear Backoff for Part Uploads
//!
//! A failed part upload is retried after a delay that grows by a fixed step per
//! attempt and is capped at a maximum:
//!
//! ```text
//! step = 1s, max = 30s
//!
//! ├─→ Attempt 1: Immediate
//! ├─→ Attempt 2: Wait 1s
//! ├─→ Attempt 3: Wait 2s
//! ├─→ ...
//! └─→ Attempt 31+: Wait 30s (capped)
//! ```
//!
//! `Linear` is created lazily on the first retryable failure of a part, so parts
//! that upload on the first try never allocate one.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Sleep;

use auditstream_core::part::MAX_ITERATION_LIMIT;

use crate::error::{Error, Result};

/// Backoff settings for part uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay added per failed attempt (default: 1s)
    #[serde(default = "default_step", with = "duration_ms")]
    pub step: Duration,

    /// Upper bound on a single delay (default: 30s)
    #[serde(default = "default_max", with = "duration_ms")]
    pub max: Duration,

    /// Upload attempts per part before giving up (default: 1000)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            step: default_step(),
            max: default_max(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step.is_zero() {
            return Err(Error::BadParameter("retry step must be positive".into()));
        }
        if self.max < self.step {
            return Err(Error::BadParameter(
                "retry max must not be smaller than retry step".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::BadParameter("retry max_attempts must be positive".into()));
        }
        Ok(())
    }
}

fn default_step() -> Duration {
    Duration::from_secs(1)
}

fn default_max() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> usize {
    MAX_ITERATION_LIMIT
}

/// Linear backoff controller.
#[derive(Debug, Clone)]
pub struct Linear {
    step: Duration,
    max: Duration,
    attempt: u32,
}

impl Linear {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            step: config.step,
            max: config.max,
            attempt: 0,
        }
    }

    /// Register one more failed attempt.
    pub fn inc(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current delay: `min(step * attempt, max)`.
    pub fn duration(&self) -> Duration {
        self.step
            .checked_mul(self.attempt)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Timer that fires after the current delay.
    pub fn after(&self) -> Sleep {
        tokio::time::sleep(self.duration())
    }
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
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
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

//! Retry delay policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::MAX_WINDOW;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * (attempt + 1)
    Linear,
}

/// Delay schedule applied when a job fails recoverably.
///
/// Delays are deterministic and capped at `max_delay`, so for a given policy
/// they never decrease as the attempt number grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Reason this policy is unusable, if any.
    pub fn check(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            return Err("base delay must not exceed the maximum delay");
        }
        if self.max_delay > MAX_WINDOW {
            return Err("maximum delay exceeds the longest supported window");
        }
        Ok(())
    }

    /// Create a policy with linear backoff.
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                // 2^attempt saturates well before u32 overflow matters.
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
            }
            BackoffStrategy::Linear => self
                .base_delay
                .checked_mul(attempt.saturating_add(1))
                .unwrap_or(self.max_delay),
        };
        delay.min(self.max_delay)
    }
}

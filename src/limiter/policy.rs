use crate::errors::{RateLimitError, Result};
use std::time::Duration;

/// The rate-limit parameters bound to an identity.
///
/// `capacity` requests are nominally permitted per `window`; the bucket
/// refills continuously at `capacity / window` tokens per second. Once a
/// bucket is exhausted the identity is penalized for `block_duration`.
///
/// Policies are built from configuration at startup and never mutated
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    /// Maximum tokens the bucket can hold.
    pub capacity: u32,
    /// Interval over which `capacity` requests are permitted.
    pub window: Duration,
    /// Penalty period applied after the bucket is exhausted.
    pub block_duration: Duration,
}

impl Policy {
    pub fn new(capacity: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            capacity,
            window,
            block_duration,
        }
    }

    /// Tokens accumulated per second.
    pub fn refill_rate(&self) -> f64 {
        self.capacity as f64 / self.window.as_secs_f64()
    }

    /// Rejects parameter combinations that can never make sense at
    /// runtime. These are programmer or configuration errors.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RateLimitError::ConfigurationError(
                "capacity must be positive".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::ConfigurationError(
                "window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

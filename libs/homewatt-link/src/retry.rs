//! Exponential backoff for connect-time retries
//!
//! Delays follow `base_delay * 2^attempt` with attempt counted from zero. There
//! is no jitter and no delay cap: the policies used here are short (a handful of
//! attempts) and only wrap connection establishment.
//!
//! No delay follows the final failed attempt. Once the policy is exhausted
//! the error goes straight back to the caller, so a failed `init()` costs
//! `base_delay * (2^(max_attempts - 1) - 1)` and nothing more.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Named retry configuration shared by every connection flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts including the first one (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Single attempt, no sleeping
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted
///
/// Returns the first success, or the error of the final attempt. The task
/// sleeps between attempts but not after the last one.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Succeeded on attempt {}/{}", attempt + 1, attempts);
                }
                return Ok(value);
            },
            Err(e) if attempt + 1 >= attempts => {
                warn!("Attempt {}/{} failed, giving up: {}", attempt + 1, attempts, e);
                return Err(e);
            },
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

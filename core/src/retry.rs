//! Bounded backoff for conflict re-runs.
//!
//! Write failures are never retried automatically. The only operations that
//! re-run are those that lost a race: a transaction whose read set changed
//! after planning, or a backend serialization/deadlock conflict. Both are
//! re-run through [`retry_while`] with the predicate deciding which errors
//! count as a lost race.
//!
//! # Example
//!
//! ```rust
//! use placement_core::retry::{RetryPolicy, retry_while};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(4)
//!     .base_delay(Duration::from_millis(5))
//!     .build();
//!
//! let value = retry_while(
//!     &policy,
//!     || async { Ok::<_, String>(7) },
//!     |err: &String| err.starts_with("conflict"),
//! )
//! .await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How many times, and how far apart, a lost race is re-run.
///
/// # Default Values
///
/// - `max_attempts`: 5 (the first run counts)
/// - `base_delay`: 10ms
/// - `max_delay`: 500ms
/// - `jitter`: enabled
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total runs including the first
    pub max_attempts: usize,
    /// Delay before the second run
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Randomize each delay in `[delay/2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Policy that never re-runs.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Un-jittered delay after the `attempt`-th failed run (0-based).
    ///
    /// Doubles per attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(u32::try_from(attempt).unwrap_or(u32::MAX)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = u64::try_from((delay - half).as_micros()).unwrap_or(u64::MAX);
        half + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set total runs (values below 1 are treated as 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the first delay.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation`, re-running it while it fails with an error for which
/// `should_retry` holds, up to `policy.max_attempts` runs.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once the attempt
/// budget is spent.
pub async fn retry_while<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after re-run");
                }
                return Ok(value);
            }
            Err(err) => {
                if !should_retry(&err) || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Lost a race, re-running"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

//! Bounded retries for store writes on the accounting path, and the delay
//! schedules shared with the quota ledger's compare-and-swap loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Delay schedule between attempts: `base * multiplier^(attempt-1)`, capped,
/// then spread uniformly by `±spread` of itself.
///
/// [`store_write`](Self::store_write) paces accounting deductions and usage-log
/// appends against a struggling store. [`contention`](Self::contention) keeps
/// quota-row compare-and-swap retries in the low milliseconds with a wide
/// spread so racing writers fall out of step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: u32,
    /// Fraction of the delay that is randomised, within `[0, 1]`.
    pub spread: f64,
}

impl ExponentialBackoff {
    pub const fn store_write() -> Self {
        Self {
            base: Duration::from_millis(50),
            cap: Duration::from_secs(2),
            multiplier: 2,
            spread: 0.2,
        }
    }

    pub const fn contention() -> Self {
        Self {
            base: Duration::from_millis(2),
            cap: Duration::from_millis(50),
            multiplier: 2,
            spread: 0.5,
        }
    }

    /// Retries back to back; tests use it to count attempts.
    pub const fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            multiplier: 1,
            spread: 0.0,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = spread.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .saturating_mul(self.multiplier.saturating_pow(exponent))
            .min(self.cap);
        if self.spread <= 0.0 || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(1.0 + self.spread * rand::random_range(-1.0..=1.0))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::store_write()
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. The last error is
    /// returned unchanged.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

//! Exponential backoff for readiness gates and orchestration steps.

use crate::errors::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

/// A retry budget ran out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub reason: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self { attempts: attempts.max(1), initial_backoff, multiplier: 2, max_backoff }
    }

    /// A single attempt, no sleeping
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Sleep before attempt `attempt + 1`, for `attempt >= 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// Returns the value and the number of attempts used.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> std::result::Result<(T, u32), Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut reason = String::new();
        for attempt in 1..=self.attempts {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    debug!(label, attempt, max_attempts = self.attempts, error = %e, "attempt failed");
                    reason = e.to_string();
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        Err(Exhausted { attempts: self.attempts, reason })
    }

    /// Poll `probe` until it reports ready. Probe errors count as not ready.
    pub async fn poll_until<F, Fut>(&self, label: &str, mut probe: F) -> std::result::Result<u32, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut reason = "never became ready".to_string();
        for attempt in 1..=self.attempts {
            match probe().await {
                Ok(true) => return Ok(attempt),
                Ok(false) => reason = "not ready".to_string(),
                Err(e) => reason = e.to_string(),
            }
            debug!(label, attempt, max_attempts = self.attempts, %reason, "gate not ready");
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        Err(Exhausted { attempts: self.attempts, reason })
    }
}

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Per-provider retry policy for endpoint calls.
///
/// `max_attempts` counts every attempt, so the default of 1 means no retry.
/// Delays are indexed by the number of failures so far; past the end of the
/// list the last entry is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delays: vec![Duration::ZERO],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// Builds a policy from configured seconds; negative delays mean no sleep.
    pub fn from_seconds(max_attempts: u32, delays: &[i64]) -> Self {
        let delays = delays
            .iter()
            .map(|&secs| Duration::from_secs(secs.max(0).unsigned_abs()))
            .collect();
        Self::new(max_attempts, delays)
    }

    /// Total attempts allowed; a configured 0 still makes one attempt.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep before the next attempt, after `failures` failed attempts (1-indexed).
    pub fn delay_after(&self, failures: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (failures.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let attempts = self.attempts();
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures += 1;
                    if !e.is_retryable() || failures >= attempts {
                        tracing::warn!(
                            operation = %what,
                            attempt = failures,
                            error = %e,
                            "Giving up"
                        );
                        return Err(e);
                    }
                    let delay = self.delay_after(failures);
                    tracing::info!(
                        operation = %what,
                        attempt = failures,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

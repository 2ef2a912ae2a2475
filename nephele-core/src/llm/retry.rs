//! Bounded retries with exponential backoff
//!
//! Used by the weather adapter for transient provider failures and by the
//! orchestrator for the single re-run of a failed synthesis.

use std::future::Future;
use std::time::Duration;

/// How many times to retry and how long to wait in between
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub retries: usize,
    /// Pause before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
    /// Growth factor applied after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt, never retried
    pub fn none() -> Self {
        Self::from_retries(0)
    }

    /// One initial attempt plus `retries` retries
    pub fn from_retries(retries: usize) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Multipliers below 1.0 are raised to 1.0 so pauses never shrink
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Total calls an operation may receive
    pub fn max_attempts(&self) -> usize {
        self.retries + 1
    }

    /// The pauses taken between attempts, in order
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            multiplier: self.backoff_multiplier.max(1.0),
            remaining: self.retries,
        }
    }
}

/// Iterator over retry pauses: `initial * multiplier^n`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    remaining: usize,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let current = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Run `operation`, retrying every failure until the retries run out
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, operation, |_| true).await
}

/// Run `operation`, retrying only failures `retryable` accepts.
///
/// The error of the last attempt is returned once the retries are spent or a
/// failure is not retryable.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut pauses = config.backoff();
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !retryable(&error) {
            return Err(error);
        }
        let Some(pause) = pauses.next() else {
            tracing::debug!(attempts = attempt, error = %error, "retries exhausted");
            return Err(error);
        };

        tracing::debug!(
            attempt,
            delay_ms = pause.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        tokio::time::sleep(pause).await;
        attempt += 1;
    }
}

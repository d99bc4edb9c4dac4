//! Deadlines and backoff for remote calls.
//!
//! Every remote call is bounded by [`within`]. Calls that are safe to
//! repeat (health probe, change pull, batch upload) go through
//! [`RetryExecutor::run`], which bounds each attempt and backs off between
//! transient failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use tandem_common::{Error, Result};

/// Backoff policy for transient remote failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub initial_delay: Duration,
    /// Cap for the doubled delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.75, 1.25)`.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    /// Run once, never retry.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry`, counted from zero.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let doubled = self.initial_delay.saturating_mul(1u32 << retry.min(20));
        let capped = doubled.min(self.max_delay);
        if self.jitter {
            capped.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Repeats remote calls after transient failures.
///
/// Only [`Error::is_retryable`] failures (network, timeout) are retried.
/// Authentication failures and malformed payloads return at once.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, each attempt bounded by `limit`, until it succeeds,
    /// fails permanently, or runs out of retries. `what` names the call in
    /// logs and timeout errors.
    pub async fn run<F, Fut, T>(&self, what: &str, limit: Duration, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            let err = match within(limit, what, operation()).await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("{} succeeded after {} retries", what, retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || retries >= self.config.max_retries {
                if retries > 0 {
                    warn!("{} gave up after {} attempts: {}", what, retries + 1, err);
                }
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            debug!("{} failed ({}), retry {} in {:?}", what, err, retries, delay);
            sleep(delay).await;
        }
    }
}

/// Run `fut` with a deadline. Running out of time is an [`Error::Timeout`].
pub async fn within<T, Fut>(limit: Duration, what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{} exceeded {:?}", what, limit))),
    }
}

//! Bounded retry with backoff
//!
//! Every network call in a cycle goes through a [`RetryPolicy`]: a fixed
//! number of extra attempts on a Fibonacci schedule from `retry::delay`,
//! capped at `max_delay` and jittered. Only errors the caller marks as
//! transient are retried. The loop itself is async; `retry::retry` blocks.

use retry::delay::{jitter, Fibonacci};
use std::future::Future;
use std::time::Duration;

/// Retry settings for one class of calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests, on-demand tooling)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delays before each retry, before jitter
    pub fn schedule(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_delay = self.max_delay;
        Fibonacci::from_millis(base_ms)
            .map(move |delay| delay.min(max_delay))
            .take(self.max_retries as usize)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delays = self.schedule().map(jitter);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => err,
                Err(err) => return Err(err),
            };
            let Some(delay) = delays.next() else {
                return Err(err);
            };
            tracing::debug!(
                operation = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

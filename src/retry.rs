//! Bounded retry with linear backoff.
//!
//! One policy type serves both the blocking storage paths and the async
//! upload path.

use std::future::Future;
use std::time::Duration;

/// How many times to attempt an operation and how long to wait in between
///
/// The wait before attempt `n` (0-based) is `base_delay * n`, so the first
/// attempt runs immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy; at least one attempt is always made
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to apply before `attempt` (0-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds or attempts run out, blocking between tries
    ///
    /// `on_retry` is called with the attempt number and the previous error
    /// before each retry. The last error is returned on exhaustion.
    pub fn run<T, E, F, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    on_retry(attempt, &err);
                    let delay = self.delay_before(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Async variant of [`RetryPolicy::run`] sleeping on the tokio timer
    pub async fn run_async<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    on_retry(attempt, &err);
                    tokio::time::sleep(self.delay_before(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

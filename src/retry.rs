//! One retry/backoff policy shared by every job that calls an external
//! service.
//!
//! | Failure class | Delay before next attempt |
//! |---------------|---------------------------|
//! | rate limit    | `base_delay × multiplier^(n-1)` (2 s, 4 s, ...) |
//! | transient     | `flat_delay` |
//! | anything else | not retried |
//!
//! Only classes listed in `retry_on` are retried at all.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ErrorClass, ServiceError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub flat_delay: Duration,
    pub retry_on: Vec<ErrorClass>,
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-based), or `None`
    /// when the error must not be retried or attempts are exhausted.
    pub fn delay_for(&self, attempt: u32, err: &ServiceError) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let class = err.class();
        if !self.retry_on.contains(&class) {
            return None;
        }
        match class {
            ErrorClass::RateLimit => {
                let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
                Some(self.base_delay.mul_f64(factor))
            }
            _ => Some(self.flat_delay),
        }
    }

    /// Run `op` until it succeeds or the policy gives up. The last error is
    /// returned unchanged so callers can still inspect its class.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.delay_for(attempt, &err) {
                    Some(delay) => {
                        if err.class() == ErrorClass::RateLimit {
                            warn!(what, attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                        } else {
                            debug!(what, attempt, error = %err, "transient failure, retrying");
                        }
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

//! Retry loop with exponential backoff and jitter.
//!
//! Each attempt of a retryable unit reports an [`Outcome`]: success,
//! a failure worth retrying, or a fatal failure that ends the loop at once.
//! [`run`] drives the attempts sequentially; the next attempt only starts
//! after the previous one has fully failed and the backoff delay elapsed.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use rand::Rng;
use tracing::{debug, warn};

use crate::{ChromaticError, Result};

/// Observer invoked before every retry with the error and the 1-based
/// number of the retry about to happen.
pub type RetryHook = Arc<dyn Fn(&ChromaticError, u32) + Send + Sync>;

/// How many times a unit may be retried, and who is told about it.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` attempts exactly once.
    pub max_retries: u32,
    pub on_retry: Option<RetryHook>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            on_retry: None,
        }
    }

    pub fn with_on_retry(
        mut self,
        hook: impl Fn(&ChromaticError, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

/// Delay schedule between attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exponential base (2.0 doubles the delay every retry).
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// No delay at all; useful in tests.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
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

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.min(32)).unwrap_or(32);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// The attempt failed and may be repeated.
    Retry(ChromaticError),
    /// The attempt failed and must not be repeated.
    Fatal(ChromaticError),
}

/// Runs `operation` until it succeeds, fails fatally, or the policy's
/// retry budget is spent. The closure receives the 0-based attempt number.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, backoff: &Backoff, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    run_observed(policy, backoff, operation, |_, _| {}).await
}

/// Like [`run`], with an extra in-crate observer that runs before the
/// policy hook on every retry.
pub(crate) async fn run_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    backoff: &Backoff,
    mut operation: F,
    mut observe: O,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T>>,
    O: FnMut(&ChromaticError, u32),
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Outcome::Success(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retrying");
                }
                return Ok(value);
            }
            Outcome::Fatal(err) => return Err(err),
            Outcome::Retry(err) => {
                if attempt >= policy.max_retries {
                    if policy.max_retries > 0 {
                        warn!(
                            attempts = attempt + 1,
                            error = %err,
                            "all retry attempts exhausted"
                        );
                    }
                    return Err(err);
                }

                attempt += 1;
                observe(&err, attempt);
                if let Some(hook) = &policy.on_retry {
                    hook(&err, attempt);
                }

                let delay = backoff.delay(attempt - 1);
                debug!(
                    retry = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "attempt failed; retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

//! Bounded retry: repeat an attempt at a fixed interval until it settles or the
//! time budget, measured from the start of the call, runs out.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::Cause;

/// Outcome of a single failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Expected to clear up given more time; the attempt is retried.
    Temporary(Cause),
    /// Propagated as-is without retrying.
    Permanent(E),
}

impl<E> Attempt<E> {
    pub fn temporary(cause: impl Into<Cause>) -> Self {
        Attempt::Temporary(cause.into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("retry timed out after {}ms", elapsed.as_millis())]
pub struct RetryTimeout {
    pub elapsed: Duration,
    /// Cause of the last temporary failure.
    #[source]
    pub last: Cause,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error(transparent)]
    Timeout(RetryTimeout),
    #[error(transparent)]
    Failed(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Retry {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            interval,
            timeout,
        }
    }

    /// Waits `delay` before the first attempt. The delay counts toward the timeout.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn execute<T, E, F>(&self, mut attempt: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, Attempt<E>>,
    {
        self.execute_async(|| std::future::ready(attempt())).await
    }

    /// Like [`Retry::execute`] for attempts that must themselves await, such as
    /// work moved off the runtime thread.
    pub async fn execute_async<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
    {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        loop {
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(Attempt::Permanent(e)) => return Err(RetryError::Failed(e)),
                Err(Attempt::Temporary(cause)) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.timeout {
                        return Err(RetryError::Timeout(RetryTimeout {
                            elapsed,
                            last: cause,
                        }));
                    }
                    tracing::trace!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        cause = %cause,
                        "attempt failed temporarily; retrying"
                    );
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

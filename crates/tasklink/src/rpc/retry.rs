//! Retry policy and the pooled, cancellable invocation loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::error::{ErrorClass, RpcError};
use crate::pool::ChannelPool;

/// Decides whether a failed attempt is worth repeating.
pub type RetryPredicate = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// How many times to try a call and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    predicate: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF)
    }
}

impl RetryPolicy {
    /// Retries transient errors; see [`RpcError::class`].
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            predicate: Arc::new(RpcError::is_transient),
        }
    }

    /// Replace the retry predicate. Cancellation is never retried regardless.
    pub fn with_predicate(mut self, predicate: impl Fn(&RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_attempts == 0 {
            return Err(RpcError::invalid_argument("max_attempts must be at least 1"));
        }
        if self.backoff.is_zero() {
            return Err(RpcError::invalid_argument("backoff must be positive"));
        }
        Ok(())
    }

    pub fn is_retryable(&self, err: &RpcError) -> bool {
        err.class() != ErrorClass::Cancelled && (self.predicate)(err)
    }
}

/// Runs calls against pooled channels with retry and cancellation.
pub struct RpcInvoker<C> {
    pool: Arc<ChannelPool<C>>,
}

impl<C> Clone for RpcInvoker<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<C: Clone + Send + 'static> RpcInvoker<C> {
    pub fn new(pool: Arc<ChannelPool<C>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ChannelPool<C>> {
        &self.pool
    }

    /// Run `call` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// Each attempt borrows a fresh channel; the channel goes back to the pool
    /// before any backoff. A non-retryable error is returned as is. Running out
    /// of attempts yields [`RpcError::Exhausted`] with every attempt's error.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        policy.validate()?;
        let mut history = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let handle = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                handle = self.pool.acquire() => handle.ok_or(RpcError::PoolClosed)?,
            };
            let Some(channel) = handle.channel().cloned() else {
                return Err(RpcError::PoolClosed);
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    handle.release_err(RpcError::Cancelled);
                    return Err(RpcError::Cancelled);
                }
                outcome = call(channel) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    handle.release_ok();
                    if attempt > 1 {
                        tracing::debug!(attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            handle.release_err(err.clone());

            let retryable = policy.is_retryable(&err);
            tracing::warn!(
                attempt,
                max_attempts = policy.max_attempts,
                retryable,
                error = %err,
                "Call attempt failed"
            );
            if !retryable {
                return Err(err);
            }

            if attempt >= policy.max_attempts {
                history.push(err.clone());
                return Err(RpcError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                    history,
                });
            }
            history.push(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }
}

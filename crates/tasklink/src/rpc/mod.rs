//! Resilient invocation of control-plane calls.
//!
//! Any call over a pooled channel handle can be wrapped: [`RpcInvoker::execute`]
//! borrows a channel per attempt, classifies failures through [`RpcError::class`]
//! and retries transient ones with a fixed backoff.

mod error;
mod retry;

pub use error::{ErrorClass, RpcError, StatusCode};
pub use retry::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, RetryPolicy, RetryPredicate, RpcInvoker};

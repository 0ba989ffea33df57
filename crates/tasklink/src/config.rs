//! Transport settings injected by the process that hosts the worker or client.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::rpc::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, RetryPolicy, RpcError};

/// 50 KiB, shared by both stream directions.
pub const DEFAULT_MAX_CHUNK_SIZE: NonZeroUsize = NonZeroUsize::MIN.saturating_add(50 * 1024 - 1);

pub const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },

    #[error(transparent)]
    Retry(#[from] RpcError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_chunk_size: NonZeroUsize,
    pub retry: RetrySettings,
    pub pool_size: usize,
    pub worker_socket: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            retry: RetrySettings::default(),
            pool_size: DEFAULT_POOL_SIZE,
            worker_socket: std::env::temp_dir().join("tasklink-worker.sock"),
        }
    }
}

impl TransportConfig {
    /// Defaults overridden by `TASKLINK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(size) = parse_positive::<usize>(&lookup, "TASKLINK_MAX_CHUNK_SIZE")? {
            config.max_chunk_size = NonZeroUsize::new(size).unwrap_or(DEFAULT_MAX_CHUNK_SIZE);
        }
        if let Some(attempts) = parse_positive::<u32>(&lookup, "TASKLINK_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_positive::<u64>(&lookup, "TASKLINK_RETRY_BACKOFF_MS")? {
            config.retry.backoff = Duration::from_millis(ms);
        }
        if let Some(size) = parse_positive::<usize>(&lookup, "TASKLINK_POOL_SIZE")? {
            config.pool_size = size;
        }
        if let Some(path) = lookup("TASKLINK_WORKER_SOCKET").filter(|p| !p.is_empty()) {
            config.worker_socket = PathBuf::from(path);
        }

        tracing::debug!(
            max_chunk_size = config.max_chunk_size.get(),
            max_attempts = config.retry.max_attempts,
            backoff_ms = config.retry.backoff.as_millis() as u64,
            pool_size = config.pool_size,
            worker_socket = %config.worker_socket.display(),
            "Transport configuration loaded"
        );
        Ok(config)
    }

    /// Channel pool capacity; an empty pool could never serve a call.
    pub fn pool_size(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.pool_size).ok_or_else(|| ConfigError::Invalid {
            var: "pool_size",
            value: self.pool_size.to_string(),
        })
    }

    /// Retry policy for control-plane calls, validated.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy::new(self.retry.max_attempts, self.retry.backoff);
        policy.validate()?;
        Ok(policy)
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Ok(Some(n)),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

use std::future::Future;
use std::time::Duration;

use coffer_core::config::StorageConfig;
use coffer_core::{CofferError, CofferResult};

/// Backoff ceiling for storage that stops answering
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay_ms: cfg.retry_delay_ms,
            retry_max_delay_ms: cfg.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// No retries, no sleeping
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
            retry_max_delay_ms: 0,
        }
    }
}

/// Whether an OpenDAL error looks like the backend being unreachable rather
/// than a definite answer.
pub fn is_transient(err: &opendal::Error) -> bool {
    err.is_temporary()
        || matches!(
            err.kind(),
            opendal::ErrorKind::Unexpected | opendal::ErrorKind::RateLimited
        )
}

/// Run `f` with exponential backoff and jitter on transient errors.
///
/// Exhausting the ceiling yields `Unreachable`; permanent errors are handed
/// to `map_err` untouched by the retry loop.
pub async fn retry_storage<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    f: F,
    map_err: impl Fn(opendal::Error) -> CofferError,
) -> CofferResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = opendal::Result<T>>,
{
    let mut delay_ms = policy.retry_delay_ms;
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if is_transient(&e) && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max = policy.max_retries,
                    "transient storage error, retrying: {e}"
                );
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms.saturating_mul(2)).min(policy.retry_max_delay_ms);
            }
            Err(e) if is_transient(&e) => {
                return Err(CofferError::Unreachable {
                    attempts: attempt + 1,
                    reason: format!("{op_name}: {e}"),
                });
            }
            Err(e) => return Err(map_err(e)),
        }
    }
}

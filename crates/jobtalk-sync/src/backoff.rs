use std::future::Future;

use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::SyncError;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. The delay doubles after each transient
/// failure, capped at `max_delay`.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                debug!(attempt, "{} failed: {}, retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

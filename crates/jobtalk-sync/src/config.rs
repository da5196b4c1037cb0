use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Never below 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
}

impl SyncConfig {
    /// Read `JOBTALK_SEND_ATTEMPTS`, `JOBTALK_BACKOFF_BASE_MS` and
    /// `JOBTALK_BACKOFF_MAX_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RetryPolicy::default();

        let max_attempts = parse_var(&lookup, "JOBTALK_SEND_ATTEMPTS")
            .unwrap_or(defaults.max_attempts)
            .max(1);
        let base_delay = parse_var(&lookup, "JOBTALK_BACKOFF_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);
        let max_delay = parse_var(&lookup, "JOBTALK_BACKOFF_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay)
            .max(base_delay);

        Self {
            retry: RetryPolicy {
                max_attempts,
                base_delay,
                max_delay,
            },
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

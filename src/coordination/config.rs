use std::time::Duration;

use serde::Deserialize;

const DEFAULT_LOCK_PREFIX: &str = "lock:";
const DEFAULT_HOLD_SECONDS: u64 = 30;
const DEFAULT_MAX_WAIT_MS: u64 = 2000;
const DEFAULT_TRIES: u32 = 5;
const DEFAULT_RANDOM_DELAY_MICROS: u64 = 10_000;

const DEFAULT_QUEUE_PREFIX: &str = "queue:";
const DEFAULT_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_HISTORY_LIMIT: usize = 32;
const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_RETURN_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub prefix: String,
    pub hold_seconds: u64,
    /// Approximate bound on the whole acquisition, spread across every attempt.
    pub max_wait_ms: u64,
    pub tries: u32,
    /// Upper bound of the jitter slept before the first attempt.
    pub random_delay_micros: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_LOCK_PREFIX.to_string(),
            hold_seconds: DEFAULT_HOLD_SECONDS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            tries: DEFAULT_TRIES,
            random_delay_micros: DEFAULT_RANDOM_DELAY_MICROS,
        }
    }
}

impl From<&crate::config::LockSettings> for LockConfig {
    fn from(settings: &crate::config::LockSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            hold_seconds: settings.hold.as_secs(),
            max_wait_ms: u64::try_from(settings.max_wait.as_millis()).unwrap_or(u64::MAX),
            tries: settings.tries.get(),
            random_delay_micros: settings.random_delay_micros,
        }
    }
}

impl LockConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_secs(self.hold_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub prefix: String,
    /// Default blocking-pop timeout; 0 checks once without waiting.
    pub timeout_seconds: u64,
    /// Audit-trail entries kept per task.
    pub history_limit: usize,
    pub retry_limit: u32,
    pub return_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            return_limit: DEFAULT_RETURN_LIMIT,
        }
    }
}

impl From<&crate::config::QueueSettings> for QueueConfig {
    fn from(settings: &crate::config::QueueSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            timeout_seconds: settings.timeout.as_secs(),
            history_limit: settings.history_limit.get(),
            retry_limit: settings.retry_limit,
            return_limit: settings.return_limit,
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

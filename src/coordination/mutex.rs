//! Named locks held as set-if-absent keys with a TTL.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info, instrument, warn};

use crate::application::diagnostics::Diagnostics;
use crate::application::repos::{KeyValueStore, SetMode, StoreError};
use crate::application::token::TokenSource;
use crate::domain::keyed::Keyed;

use super::config::LockConfig;

pub(crate) const METRIC_LOCK_ATTEMPT_TOTAL: &str = "larder_lock_attempt_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Unavailable,
    /// Another holder has it. `remaining` is `None` when the holder set no expiry or
    /// released it between the attempt and the TTL read.
    Held { remaining: Option<Duration> },
    Acquired { token: String },
}

impl LockOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Held { .. } => "held",
            Self::Acquired { .. } => "acquired",
        }
    }
}

impl Serialize for LockOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", self.label())?;
        match self {
            Self::Unavailable => {}
            Self::Held { remaining } => {
                map.serialize_entry("remaining_ms", &remaining.map(|d| d.as_millis() as u64))?;
            }
            Self::Acquired { token } => map.serialize_entry("token", token)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseOutcome {
    Unavailable,
    Released,
    TokenMismatch,
}

/// Per-call overrides of [`LockConfig`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub hold: Option<Duration>,
    pub max_wait: Option<Duration>,
    pub tries: Option<u32>,
    pub random_delay: Option<Duration>,
    pub diagnostics: Diagnostics,
}

pub struct DistributedMutex {
    kv: Arc<dyn KeyValueStore>,
    tokens: Arc<dyn TokenSource>,
    config: LockConfig,
}

impl DistributedMutex {
    pub fn new(kv: Arc<dyn KeyValueStore>, tokens: Arc<dyn TokenSource>, config: LockConfig) -> Self {
        Self { kv, tokens, config }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.config.prefix)
    }

    /// Tries to claim one of `names`, which are interchangeable. The first claimed name
    /// wins and the rest are abandoned; the result holds the last outcome per attempted name.
    #[instrument(skip_all, fields(candidates = names.len()))]
    pub async fn acquire(
        &self,
        names: &[String],
        token: Option<String>,
        options: &AcquireOptions,
    ) -> Keyed<LockOutcome> {
        let mut outcomes = Keyed::new();
        if names.is_empty() {
            return outcomes;
        }

        let token = token.unwrap_or_else(|| self.tokens.token());
        let hold = options.hold.unwrap_or_else(|| self.config.hold());
        let tries = options.tries.unwrap_or(self.config.tries).max(1);
        let max_wait = options.max_wait.unwrap_or_else(|| self.config.max_wait());
        let random_delay = options
            .random_delay
            .unwrap_or(Duration::from_micros(self.config.random_delay_micros));

        let attempts = tries.saturating_mul(u32::try_from(names.len()).unwrap_or(u32::MAX));
        let pause = max_wait / attempts;

        let jitter = {
            let bound = u64::try_from(random_delay.as_micros()).unwrap_or(u64::MAX);
            Duration::from_micros(rand::thread_rng().gen_range(0..=bound))
        };
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }

        let mut attempt = 0;
        for _ in 0..tries {
            for name in names {
                attempt += 1;
                let outcome = if options.diagnostics.test {
                    debug!(name = %name, "dry run: reporting lock as acquired without writing");
                    LockOutcome::Acquired {
                        token: token.clone(),
                    }
                } else {
                    self.attempt(name, &token, hold).await
                };
                counter!(METRIC_LOCK_ATTEMPT_TOTAL, "outcome" => outcome.label()).increment(1);
                if options.diagnostics.verbose {
                    info!(name = %name, attempt, outcome = outcome.label(), "lock attempt");
                }

                let done = !matches!(outcome, LockOutcome::Held { .. });
                outcomes.insert(name.as_str(), outcome);
                if done {
                    return outcomes;
                }
                if attempt < attempts && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
        outcomes
    }

    async fn attempt(&self, name: &str, token: &str, hold: Duration) -> LockOutcome {
        let key = self.key(name);
        let claimed = match self
            .kv
            .set(&key, token, SetMode::IfAbsent, Some(hold))
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => return unavailable(&key, &err),
        };

        if claimed {
            // Read back: another holder may have won and expired in between.
            match self.kv.get(&key).await {
                Ok(Some(current)) if current == token => {
                    return LockOutcome::Acquired {
                        token: token.to_string(),
                    };
                }
                Ok(_) => debug!(key = %key, "lock changed hands right after it was claimed"),
                Err(err) => return unavailable(&key, &err),
            }
        }

        match self.kv.ttl(&key).await {
            Ok(remaining) => LockOutcome::Held { remaining },
            Err(err) => unavailable(&key, &err),
        }
    }

    /// Releases `name`. With a token the lock is only deleted while it still holds that token.
    /// Releasing a lock nobody holds reports `Released`.
    #[instrument(skip(self, token, diagnostics))]
    pub async fn release(
        &self,
        name: &str,
        token: Option<&str>,
        diagnostics: Diagnostics,
    ) -> ReleaseOutcome {
        let key = self.key(name);
        if let Some(expected) = token {
            match self.kv.get(&key).await {
                Ok(Some(current)) if current != expected => {
                    if diagnostics.verbose {
                        info!(key = %key, "lock is held under another token; not releasing");
                    }
                    return ReleaseOutcome::TokenMismatch;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "lock store unavailable");
                    return ReleaseOutcome::Unavailable;
                }
            }
        }

        if diagnostics.test {
            debug!(key = %key, "dry run: skipping lock delete");
            return ReleaseOutcome::Released;
        }
        match self.kv.delete(&[key.clone()]).await {
            Ok(_) => ReleaseOutcome::Released,
            Err(err) => {
                warn!(key = %key, error = %err, "lock store unavailable");
                ReleaseOutcome::Unavailable
            }
        }
    }
}

fn unavailable(key: &str, err: &StoreError) -> LockOutcome {
    warn!(key, error = %err, "lock store unavailable");
    LockOutcome::Unavailable
}

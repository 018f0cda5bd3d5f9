//! Cache configuration.
//!
//! Handler-level defaults for the cache-aside orchestrator, read from the `[cache]` section.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_MAX_ENTRY_BYTES: usize = 64 * 1024;

/// What to do with a cached row that fails the caller's column conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionMissPolicy {
    /// Treat the cached row as a confirmed non-match: drop it, never ask the store.
    #[default]
    Exclude,
    /// Treat it like any other invalid hit and resolve it from the store.
    Refetch,
}

impl std::str::FromStr for ConditionMissPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exclude" => Ok(Self::Exclude),
            "refetch" => Ok(Self::Refetch),
            other => Err(format!("unknown condition miss policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default for the per-call `use_cache` gate.
    pub use_cache: bool,
    /// Entry lifetime in seconds; 0 means entries never expire.
    pub ttl_seconds: u64,
    /// Size ceiling for one serialized row; grouped entries scale it by item count.
    pub max_entry_bytes: usize,
    /// Whether hits must carry every requested column.
    pub compare_columns: bool,
    pub condition_miss_policy: ConditionMissPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            compare_columns: true,
            condition_miss_policy: ConditionMissPolicy::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            use_cache: settings.use_cache,
            ttl_seconds: settings.ttl_seconds,
            max_entry_bytes: settings.max_entry_bytes.get(),
            compare_columns: settings.compare_columns,
            condition_miss_policy: settings.condition_miss_policy,
        }
    }
}

impl CacheConfig {
    /// Entry TTL, `None` when entries never expire.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }

    /// Ceiling for an entry holding `items` rows. Saturates instead of overflowing.
    pub fn ceiling_for(&self, items: usize) -> usize {
        self.max_entry_bytes.saturating_mul(items.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_means_no_expiry() {
        let config = CacheConfig {
            ttl_seconds: 0,
            ..CacheConfig::default()
        };
        assert_eq!(config.ttl(), None);
        assert_eq!(
            CacheConfig::default().ttl(),
            Some(Duration::from_secs(DEFAULT_TTL_SECONDS))
        );
    }

    #[test]
    fn ceiling_scales_with_group_size() {
        let config = CacheConfig {
            max_entry_bytes: 100,
            ..CacheConfig::default()
        };
        assert_eq!(config.ceiling_for(0), 100);
        assert_eq!(config.ceiling_for(3), 300);
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            "Refetch".parse::<ConditionMissPolicy>(),
            Ok(ConditionMissPolicy::Refetch)
        );
        assert!("drop".parse::<ConditionMissPolicy>().is_err());
    }
}

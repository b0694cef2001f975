//! Service configuration.
//!
//! [`CounterSettings`] is read-only once a service is built. It names the
//! record kinds used in the store and the fan-out given to newly created
//! counters. It also sets how long cached totals live and what to do when a
//! cache increment fails.
//!
//! # Examples
//!
//! ```rust
//! use contatori_store::settings::{
//!     CacheFailurePolicy, CounterSettings, DEFAULT_CACHE_TTL, DEFAULT_SHARDS,
//! };
//!
//! let settings = CounterSettings::default();
//! assert_eq!(settings.default_shards, DEFAULT_SHARDS);
//! assert_eq!(settings.cache_ttl, Some(DEFAULT_CACHE_TTL));
//!
//! let settings = CounterSettings::new()
//!     .with_default_shards(8)
//!     .with_kinds("PageViewConfig", "PageViewShard")
//!     .with_cache_failure_policy(CacheFailurePolicy::Ignore);
//! assert_eq!(settings.cache_key("home"), "PageViewShard:home");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fan-out given to a counter the first time it is written.
pub const DEFAULT_SHARDS: u32 = 20;

/// Lifetime of a total cached by `count`.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default record kind for counter configuration.
pub const CONFIG_KIND: &str = "GeneralCounterShardConfig";

/// Default record kind for shards.
pub const SHARD_KIND: &str = "GeneralCounterShard";

/// What to do with the cached total when a post-commit cache increment fails.
///
/// An increment that finds no cache entry is not a failure and never
/// triggers this policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFailurePolicy {
    /// Delete the entry so the next `count` re-aggregates from the store.
    #[default]
    Invalidate,
    /// Leave the entry alone; it stays stale until evicted.
    Ignore,
}

/// Configuration for a [`ShardedCounter`](crate::service::ShardedCounter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    /// Fan-out assigned when a counter's config is created lazily.
    pub default_shards: u32,
    /// Record kind under which counter configs are stored.
    pub config_kind: String,
    /// Record kind under which shards are stored; also prefixes cache keys.
    pub shard_kind: String,
    /// Lifetime of cached totals. `None` keeps them until evicted, which
    /// lets an undercount from a racing increment persist.
    pub cache_ttl: Option<Duration>,
    /// Reaction to a failed cache increment.
    pub cache_failure_policy: CacheFailurePolicy,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            default_shards: DEFAULT_SHARDS,
            config_kind: CONFIG_KIND.to_string(),
            shard_kind: SHARD_KIND.to_string(),
            cache_ttl: Some(DEFAULT_CACHE_TTL),
            cache_failure_policy: CacheFailurePolicy::default(),
        }
    }
}

impl CounterSettings {
    /// Creates settings with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fan-out for newly created counters. Zero is clamped to one.
    pub fn with_default_shards(mut self, shards: u32) -> Self {
        self.default_shards = shards.max(1);
        self
    }

    /// Sets the record kinds for configs and shards.
    pub fn with_kinds(mut self, config_kind: &str, shard_kind: &str) -> Self {
        self.config_kind = config_kind.to_string();
        self.shard_kind = shard_kind.to_string();
        self
    }

    /// Sets the lifetime of cached totals; `None` disables expiry.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the cache failure policy.
    pub fn with_cache_failure_policy(mut self, policy: CacheFailurePolicy) -> Self {
        self.cache_failure_policy = policy;
        self
    }

    /// Cache key holding the aggregate total for `name`.
    pub fn cache_key(&self, name: &str) -> String {
        format!("{}:{}", self.shard_kind, name)
    }
}

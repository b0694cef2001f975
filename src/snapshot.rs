//! Serializable view of the service statistics.
//!
//! # Examples
//!
//! ```rust
//! use contatori_store::snapshot::StatsSnapshot;
//!
//! let snapshot = StatsSnapshot {
//!     cache_hits: 9,
//!     cache_misses: 1,
//!     ..Default::default()
//! };
//!
//! assert_eq!(snapshot.cache_hit_ratio(), Some(0.9));
//! let json = snapshot.to_json(false).unwrap();
//! assert!(json.contains(r#""cache_hits":9"#));
//! ```

use serde::{Deserialize, Serialize};

/// Point-in-time copy of [`ServiceStats`](crate::stats::ServiceStats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// `count` calls answered from the cache.
    pub cache_hits: u64,
    /// `count` calls that had to aggregate shards.
    pub cache_misses: u64,
    /// Cache failures swallowed by the service.
    pub cache_errors: u64,
    /// Completed shard aggregation scans.
    pub aggregations: u64,
    /// Committed shard increments.
    pub increments: u64,
    /// Fan-out changes written by `increase_shards`.
    pub fanout_increases: u64,
}

impl StatsSnapshot {
    /// Statistic names and values, in a fixed order.
    pub fn entries(&self) -> [(&'static str, u64); 6] {
        [
            ("cache_hits", self.cache_hits),
            ("cache_misses", self.cache_misses),
            ("cache_errors", self.cache_errors),
            ("aggregations", self.aggregations),
            ("increments", self.increments),
            ("fanout_increases", self.fanout_increases),
        ]
    }

    /// Fraction of `count` calls served from the cache, if any were made.
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }

    /// Serializes to JSON.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

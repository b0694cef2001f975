//! Shard selection strategies.
//!
//! Increments pick their shard with purely local randomness: no coordination
//! between callers or service instances is needed, and balance across shards
//! is statistical rather than exact. Tests that need a known placement swap
//! in [`FixedShard`].

use rand::Rng;

/// Chooses the shard an increment is routed to.
pub trait ShardSelector: Send + Sync {
    /// Returns an index in `[0, shard_count)`. `shard_count` is at least one.
    fn select(&self, shard_count: u32) -> u32;
}

/// Uniformly random selection using the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomShard;

impl ShardSelector for RandomShard {
    #[inline]
    fn select(&self, shard_count: u32) -> u32 {
        rand::rng().random_range(0..shard_count.max(1))
    }
}

/// Always selects the same index, wrapped into range.
///
/// # Examples
///
/// ```rust
/// use contatori_store::selector::{FixedShard, ShardSelector};
///
/// assert_eq!(FixedShard(3).select(20), 3);
/// assert_eq!(FixedShard(23).select(20), 3);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedShard(pub u32);

impl ShardSelector for FixedShard {
    #[inline]
    fn select(&self, shard_count: u32) -> u32 {
        self.0 % shard_count.max(1)
    }
}

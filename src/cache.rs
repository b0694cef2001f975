//! The best-effort cache holding aggregate totals.
//!
//! The cache is never authoritative. Any call may fail, any entry may vanish,
//! and a miss never means zero. The one hard rule for implementations is that
//! [`increment_existing`](Cache::increment_existing) must not create an
//! entry: a total fabricated from a zero base would drift away from the sum
//! of the shards and never recover until evicted.
//!
//! A total written by `count` can still miss an increment that commits
//! between the aggregation and the write. Entries therefore carry an expiry,
//! which bounds how long such an undercount survives.

mod memory;

pub use memory::MemoryCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::CacheError;

/// Best-effort key/value cache of `u64` totals.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the cached value, or `None` on a miss.
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<u64>, CacheError>;

    /// Stores a value, replacing any previous one. The entry expires after
    /// `ttl`, or never if `ttl` is `None`.
    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Adds `delta` to an existing entry and returns the new value.
    ///
    /// Returns `Ok(None)` without creating anything when the entry is absent.
    async fn increment_existing(
        &self,
        ctx: &Context,
        key: &str,
        delta: u64,
    ) -> Result<Option<u64>, CacheError>;

    /// Removes an entry. Removing an absent entry succeeds.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: Cache + ?Sized> Cache for Arc<T> {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<u64>, CacheError> {
        (**self).get(ctx, key).await
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        (**self).set(ctx, key, value, ttl).await
    }

    async fn increment_existing(
        &self,
        ctx: &Context,
        key: &str,
        delta: u64,
    ) -> Result<Option<u64>, CacheError> {
        (**self).increment_existing(ctx, key, delta).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError> {
        (**self).delete(ctx, key).await
    }
}

/// A cache that holds nothing. Every lookup misses and every write is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(&self, _ctx: &Context, _key: &str) -> Result<Option<u64>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _ctx: &Context,
        _key: &str,
        _value: u64,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn increment_existing(
        &self,
        _ctx: &Context,
        _key: &str,
        _delta: u64,
    ) -> Result<Option<u64>, CacheError> {
        Ok(None)
    }

    async fn delete(&self, _ctx: &Context, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_cache_always_misses() {
        let ctx = Context::new();
        let cache = NoCache;
        cache.set(&ctx, "k", 5, None).await.unwrap();
        assert_eq!(cache.get(&ctx, "k").await.unwrap(), None);
        assert_eq!(cache.increment_existing(&ctx, "k", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_arc_forwards() {
        let ctx = Context::new();
        let cache = Arc::new(MemoryCache::new());
        cache.set(&ctx, "k", 5, None).await.unwrap();
        assert_eq!(Cache::get(&cache, &ctx, "k").await.unwrap(), Some(5));
    }
}

//! In-process [`Cache`] with per-entry expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::Cache;
use crate::context::Context;
use crate::error::CacheError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Drops `key` if it has expired, then returns it if still present.
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

/// Mutex-guarded map of totals.
///
/// Each entry expires after the TTL given to [`set`](Cache::set).
/// [`with_max_ttl`](Self::with_max_ttl) caps that TTL, including for entries
/// set without one.
///
/// [`set_unavailable`](Self::set_unavailable) makes every call fail, which
/// lets tests check that cache outages never reach the caller.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use contatori_store::cache::{Cache, MemoryCache};
/// use contatori_store::context::Context;
///
/// # futures::executor::block_on(async {
/// let cache = MemoryCache::new().with_max_ttl(Duration::from_secs(300));
/// let ctx = Context::new();
///
/// assert_eq!(cache.increment_existing(&ctx, "hits", 1).await.unwrap(), None);
/// cache.set(&ctx, "hits", 10, Some(Duration::from_secs(60))).await.unwrap();
/// assert_eq!(cache.increment_existing(&ctx, "hits", 1).await.unwrap(), Some(11));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_ttl: Option<Duration>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    /// Creates an empty cache whose entries never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires every entry at most `max_ttl` after it was last set.
    pub fn with_max_ttl(self, max_ttl: Duration) -> Self {
        Self {
            max_ttl: Some(max_ttl),
            ..self
        }
    }

    /// Makes every operation fail with [`CacheError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Returns `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, ctx: &Context) -> Result<(), CacheError> {
        ctx.check()?;
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("memory cache offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<u64>, CacheError> {
        self.check(ctx)?;
        Ok(live_entry(&mut self.entries.lock(), key).map(|entry| entry.value))
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.check(ctx)?;
        let ttl = match (ttl, self.max_ttl) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (ttl, max) => ttl.or(max),
        };
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn increment_existing(
        &self,
        ctx: &Context,
        key: &str,
        delta: u64,
    ) -> Result<Option<u64>, CacheError> {
        self.check(ctx)?;
        Ok(live_entry(&mut self.entries.lock(), key).map(|entry| {
            entry.value = entry.value.saturating_add(delta);
            entry.value
        }))
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), CacheError> {
        self.check(ctx)?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

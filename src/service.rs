//! The counter service: cache-aside reads over sharded transactional writes.
//!
//! ```text
//!   increment(name)                         count(name)
//!        │                                       │
//!        ▼                                       ▼
//!   config txn: get-or-init fan-out         cache.get ──hit──► total
//!        │                                       │ miss
//!        ▼                                       ▼
//!   pick shard i in [0, fan-out)            query every shard of name
//!        │                                       │
//!        ▼                                       ▼
//!   shard txn: shard[i].count += delta      sum counts ──► cache.set
//!        │
//!        ▼
//!   cache.increment_existing (best-effort, never creates)
//! ```
//!
//! The service holds no state between calls beyond its collaborators and
//! diagnostic statistics; every consistency guarantee comes from the store's
//! transactions. Cache failures are logged and swallowed, store failures are
//! returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::cache::{Cache, NoCache};
use crate::config_store::ConfigStore;
use crate::context::Context;
use crate::error::{CacheError, CounterError, Result};
use crate::selector::{RandomShard, ShardSelector};
use crate::settings::{CacheFailurePolicy, CounterSettings};
use crate::shard_store::ShardStore;
use crate::snapshot::StatsSnapshot;
use crate::stats::ServiceStats;
use crate::store::Datastore;

/// Budget for invalidating a cached total after the caller's context was
/// interrupted.
const DETACHED_INVALIDATE_TIMEOUT: Duration = Duration::from_secs(1);

/// A family of sharded counters stored in `S` and cached in `C`.
///
/// Cloning is cheap and clones share the same store, cache and statistics.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use contatori_store::cache::MemoryCache;
/// use contatori_store::context::Context;
/// use contatori_store::service::ShardedCounter;
/// use contatori_store::store::MemoryStore;
///
/// # futures::executor::block_on(async {
/// let counter = ShardedCounter::new(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
/// let ctx = Context::new();
///
/// counter.increment(&ctx, "visits").await?;
/// counter.increment(&ctx, "visits").await?;
/// counter.increase_shards(&ctx, "visits", 50).await?;
/// counter.increment(&ctx, "visits").await?;
///
/// assert_eq!(counter.count(&ctx, "visits").await?, 3);
/// assert_eq!(counter.shard_count(&ctx, "visits").await?, 50);
/// # Ok::<(), contatori_store::error::CounterError>(())
/// # }).unwrap();
/// ```
pub struct ShardedCounter<S, C = NoCache> {
    configs: ConfigStore<S>,
    shards: ShardStore<S>,
    cache: Arc<C>,
    selector: Arc<dyn ShardSelector>,
    settings: Arc<CounterSettings>,
    stats: Arc<ServiceStats>,
}

impl<S, C> Clone for ShardedCounter<S, C> {
    fn clone(&self) -> Self {
        Self {
            configs: self.configs.clone(),
            shards: self.shards.clone(),
            cache: Arc::clone(&self.cache),
            selector: Arc::clone(&self.selector),
            settings: Arc::clone(&self.settings),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: Datastore> ShardedCounter<S, NoCache> {
    /// Creates a service that never caches totals.
    pub fn uncached(store: Arc<S>) -> Self {
        Self::new(store, Arc::new(NoCache))
    }
}

impl<S: Datastore, C: Cache> ShardedCounter<S, C> {
    /// Creates a service with default settings and random shard selection.
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self::with_settings(store, cache, CounterSettings::default())
    }

    /// Creates a service with the given settings.
    pub fn with_settings(store: Arc<S>, cache: Arc<C>, settings: CounterSettings) -> Self {
        Self {
            configs: ConfigStore::new(
                Arc::clone(&store),
                settings.config_kind.as_str(),
                settings.default_shards,
            ),
            shards: ShardStore::new(
                store,
                settings.config_kind.as_str(),
                settings.shard_kind.as_str(),
            ),
            cache,
            selector: Arc::new(RandomShard),
            settings: Arc::new(settings),
            stats: Arc::new(ServiceStats::new()),
        }
    }

    /// Replaces the shard selection strategy.
    pub fn with_selector(self, selector: impl ShardSelector + 'static) -> Self {
        Self {
            selector: Arc::new(selector),
            ..self
        }
    }

    /// The settings this service was built with.
    pub fn settings(&self) -> &CounterSettings {
        &self.settings
    }

    /// Typed access to the config records.
    pub fn config_store(&self) -> &ConfigStore<S> {
        &self.configs
    }

    /// Typed access to the shard records.
    pub fn shard_store(&self) -> &ShardStore<S> {
        &self.shards
    }

    /// Current activity statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the best-known total for `name`.
    ///
    /// Served from the cache when possible. On a miss every shard of the
    /// counter is summed and the total written back to the cache with the
    /// configured TTL. A counter that was never incremented counts zero.
    ///
    /// An increment committing between the sum and the cache write is not
    /// reflected in the cached total until it expires.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn count(&self, ctx: &Context, name: &str) -> Result<u64> {
        validate_name(name)?;
        let cache_key = self.settings.cache_key(name);

        match ctx.run(self.cache.get(ctx, &cache_key)).await {
            Ok(Some(total)) => {
                self.stats.cache_hits.incr();
                return Ok(total);
            }
            Ok(None) => {}
            Err(err) => self.cache_failed("get", &cache_key, &err),
        }
        self.stats.cache_misses.incr();

        let total = ctx.run(self.shards.total(ctx, name)).await?;
        self.stats.aggregations.incr();
        debug!(total, "aggregated shards");

        let ttl = self.settings.cache_ttl;
        if let Err(err) = ctx.run(self.cache.set(ctx, &cache_key, total, ttl)).await {
            self.cache_failed("set", &cache_key, &err);
        }
        Ok(total)
    }

    /// Adds one to `name`.
    ///
    /// Not idempotent: retrying after an ambiguous failure may count twice.
    pub async fn increment(&self, ctx: &Context, name: &str) -> Result<()> {
        self.increment_by(ctx, name, 1).await
    }

    /// Adds `delta` to `name` on a randomly selected shard.
    ///
    /// The counter's config is created with the default fan-out on first
    /// use. If that step fails no shard is touched; if the shard write fails
    /// the config stays initialized and the call can be retried.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn increment_by(&self, ctx: &Context, name: &str, delta: u64) -> Result<()> {
        validate_name(name)?;
        if delta == 0 {
            return Ok(());
        }
        let config = ctx.run(self.configs.get_or_init(ctx, name)).await?;
        let index = self.selector.select(config.shards);
        self.apply(ctx, name, index, delta).await
    }

    /// Adds one to shard `index` of `name`, bypassing the selector.
    ///
    /// Fails with [`CounterError::InvalidShardIndex`] if `index` is not below
    /// the counter's fan-out.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn increment_shard(&self, ctx: &Context, name: &str, index: u32) -> Result<()> {
        validate_name(name)?;
        let config = ctx.run(self.configs.get_or_init(ctx, name)).await?;
        if index >= config.shards {
            return Err(CounterError::InvalidShardIndex {
                index,
                shard_count: config.shards,
            });
        }
        self.apply(ctx, name, index, 1).await
    }

    /// Raises the fan-out of `name` to at least `shards`. Never lowers it.
    ///
    /// A counter without a config gets the default fan-out first, so the
    /// result is `max(current, shards)` with `current` defaulting to the
    /// configured default. Nothing is written if the fan-out is already
    /// large enough.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn increase_shards(&self, ctx: &Context, name: &str, shards: u32) -> Result<()> {
        validate_name(name)?;
        let (config, written) = ctx.run(self.configs.raise(ctx, name, shards)).await?;
        if written {
            self.stats.fanout_increases.incr();
            debug!(shards = config.shards, "fan-out updated");
        }
        Ok(())
    }

    /// The fan-out recorded for `name`, or the default if it has none yet.
    /// Never writes.
    pub async fn shard_count(&self, ctx: &Context, name: &str) -> Result<u32> {
        validate_name(name)?;
        let config = ctx.run(self.configs.load(ctx, name)).await?;
        Ok(config.map_or(self.configs.default_shards(), |config| config.shards))
    }

    async fn apply(&self, ctx: &Context, name: &str, index: u32, delta: u64) -> Result<()> {
        let shard = ctx
            .run(self.shards.increment(ctx, name, index, delta))
            .await?;
        self.stats.increments.incr();
        debug!(shard = index, shard_count = shard.count, delta, "shard incremented");

        let cache_key = self.settings.cache_key(name);
        if let Err(err) = ctx
            .run(self.cache.increment_existing(ctx, &cache_key, delta))
            .await
        {
            self.cache_failed("increment", &cache_key, &err);
            if self.settings.cache_failure_policy == CacheFailurePolicy::Invalidate {
                self.invalidate(ctx, &cache_key).await;
            }
        }
        Ok(())
    }

    /// Deletes a cached total that may have missed a committed increment.
    ///
    /// The shard write already happened, so an interrupted caller context
    /// must not stop the delete: it then runs on a detached context with its
    /// own short deadline.
    async fn invalidate(&self, ctx: &Context, cache_key: &str) {
        let detached;
        let ctx = if ctx.check().is_err() {
            detached = Context::new().with_timeout(DETACHED_INVALIDATE_TIMEOUT);
            &detached
        } else {
            ctx
        };
        if let Err(err) = ctx.run(self.cache.delete(ctx, cache_key)).await {
            self.cache_failed("delete", cache_key, &err);
        }
    }

    fn cache_failed(&self, op: &'static str, key: &str, err: &CacheError) {
        self.stats.cache_errors.incr();
        warn!(op, key, error = %err, "cache operation failed");
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CounterError::InvalidName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::StoreError;
    use crate::records::{CounterConfig, Key, Shard};
    use crate::selector::FixedShard;
    use crate::settings::{CONFIG_KIND, SHARD_KIND};
    use crate::store::{Entity, MemoryStore, MemoryStoreSettings, Query, TxnOp};

    type Service = ShardedCounter<MemoryStore, MemoryCache>;

    fn service() -> (Arc<MemoryStore>, Arc<MemoryCache>, Service) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let counter = ShardedCounter::new(Arc::clone(&store), Arc::clone(&cache));
        (store, cache, counter)
    }

    /// A fresh service over the same store, with an empty cache.
    fn cold(store: &Arc<MemoryStore>) -> Service {
        ShardedCounter::new(Arc::clone(store), Arc::new(MemoryCache::new()))
    }

    /// Cache whose increments always fail while every other call works.
    #[derive(Default)]
    struct BrokenIncrements(MemoryCache);

    #[async_trait]
    impl Cache for BrokenIncrements {
        async fn get(
            &self,
            ctx: &Context,
            key: &str,
        ) -> std::result::Result<Option<u64>, CacheError> {
            self.0.get(ctx, key).await
        }

        async fn set(
            &self,
            ctx: &Context,
            key: &str,
            value: u64,
            ttl: Option<Duration>,
        ) -> std::result::Result<(), CacheError> {
            self.0.set(ctx, key, value, ttl).await
        }

        async fn increment_existing(
            &self,
            _ctx: &Context,
            _key: &str,
            _delta: u64,
        ) -> std::result::Result<Option<u64>, CacheError> {
            Err(CacheError::Unavailable("increment dropped".to_string()))
        }

        async fn delete(&self, ctx: &Context, key: &str) -> std::result::Result<(), CacheError> {
            self.0.delete(ctx, key).await
        }
    }

    /// Cache that lets one increment from another service commit right
    /// before the first total is written.
    struct RacingSet {
        inner: MemoryCache,
        other: ShardedCounter<MemoryStore, NoCache>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl Cache for RacingSet {
        async fn get(
            &self,
            ctx: &Context,
            key: &str,
        ) -> std::result::Result<Option<u64>, CacheError> {
            self.inner.get(ctx, key).await
        }

        async fn set(
            &self,
            ctx: &Context,
            key: &str,
            value: u64,
            ttl: Option<Duration>,
        ) -> std::result::Result<(), CacheError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.other
                    .increment(ctx, "visits")
                    .await
                    .map_err(|err| CacheError::Unavailable(err.to_string()))?;
            }
            self.inner.set(ctx, key, value, ttl).await
        }

        async fn increment_existing(
            &self,
            ctx: &Context,
            key: &str,
            delta: u64,
        ) -> std::result::Result<Option<u64>, CacheError> {
            self.inner.increment_existing(ctx, key, delta).await
        }

        async fn delete(&self, ctx: &Context, key: &str) -> std::result::Result<(), CacheError> {
            self.inner.delete(ctx, key).await
        }
    }

    /// Cache that cancels the caller's context when asked to increment.
    #[derive(Default)]
    struct CancelOnIncrement(MemoryCache);

    #[async_trait]
    impl Cache for CancelOnIncrement {
        async fn get(
            &self,
            ctx: &Context,
            key: &str,
        ) -> std::result::Result<Option<u64>, CacheError> {
            self.0.get(ctx, key).await
        }

        async fn set(
            &self,
            ctx: &Context,
            key: &str,
            value: u64,
            ttl: Option<Duration>,
        ) -> std::result::Result<(), CacheError> {
            self.0.set(ctx, key, value, ttl).await
        }

        async fn increment_existing(
            &self,
            ctx: &Context,
            key: &str,
            delta: u64,
        ) -> std::result::Result<Option<u64>, CacheError> {
            ctx.cancel();
            self.0.increment_existing(ctx, key, delta).await
        }

        async fn delete(&self, ctx: &Context, key: &str) -> std::result::Result<(), CacheError> {
            self.0.delete(ctx, key).await
        }
    }

    /// Store whose first attempt at each shard transaction waits until two
    /// such attempts have read their record, so both read before either
    /// commits.
    struct Rendezvous {
        inner: Arc<MemoryStore>,
        barrier: Barrier,
    }

    impl Rendezvous {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                barrier: Barrier::new(2),
            }
        }
    }

    #[async_trait]
    impl Datastore for Rendezvous {
        async fn get(
            &self,
            ctx: &Context,
            key: &Key,
        ) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(ctx, key).await
        }

        async fn put(
            &self,
            ctx: &Context,
            key: &Key,
            value: Vec<u8>,
        ) -> std::result::Result<(), StoreError> {
            self.inner.put(ctx, key, value).await
        }

        async fn run_in_transaction(
            &self,
            ctx: &Context,
            key: &Key,
            op: &mut TxnOp<'_>,
        ) -> std::result::Result<(), StoreError> {
            let mut first = key.kind() == SHARD_KIND;
            let barrier = &self.barrier;
            self.inner
                .run_in_transaction(ctx, key, &mut |current| {
                    if std::mem::take(&mut first) {
                        barrier.wait();
                    }
                    op(current)
                })
                .await
        }

        fn query<'a>(
            &'a self,
            ctx: &'a Context,
            query: Query,
        ) -> BoxStream<'a, std::result::Result<Entity, StoreError>> {
            self.inner.query(ctx, query)
        }
    }

    /// Store that writes one more shard while a query is being consumed.
    struct LateShard {
        inner: Arc<MemoryStore>,
        late: parking_lot::Mutex<Option<(Key, Vec<u8>)>>,
    }

    #[async_trait]
    impl Datastore for LateShard {
        async fn get(
            &self,
            ctx: &Context,
            key: &Key,
        ) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(ctx, key).await
        }

        async fn put(
            &self,
            ctx: &Context,
            key: &Key,
            value: Vec<u8>,
        ) -> std::result::Result<(), StoreError> {
            self.inner.put(ctx, key, value).await
        }

        async fn run_in_transaction(
            &self,
            ctx: &Context,
            key: &Key,
            op: &mut TxnOp<'_>,
        ) -> std::result::Result<(), StoreError> {
            self.inner.run_in_transaction(ctx, key, op).await
        }

        fn query<'a>(
            &'a self,
            ctx: &'a Context,
            query: Query,
        ) -> BoxStream<'a, std::result::Result<Entity, StoreError>> {
            self.inner
                .query(ctx, query)
                .then(move |entity| async move {
                    let late = self.late.lock().take();
                    if let Some((key, value)) = late {
                        self.inner.put(ctx, &key, value).await?;
                    }
                    entity
                })
                .boxed()
        }
    }

    /// Runs one increment per counter on its own thread, all at once.
    fn increment_in_parallel<S: Datastore + 'static>(counters: Vec<ShardedCounter<S, NoCache>>) {
        std::thread::scope(|scope| {
            let handles: Vec<_> = counters
                .iter()
                .map(|counter| {
                    scope.spawn(move || {
                        futures::executor::block_on(counter.increment(&Context::new(), "visits"))
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_count_never_incremented() {
        let (store, _, counter) = service();
        assert_eq!(counter.count(&Context::new(), "visits").await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_visits_scenario() {
        let (_, _, counter) = service();
        let ctx = Context::new();

        for _ in 0..3 {
            counter.increment(&ctx, "visits").await.unwrap();
        }
        counter.increase_shards(&ctx, "visits", 5).await.unwrap();
        for _ in 0..2 {
            counter.increment(&ctx, "visits").await.unwrap();
        }

        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cold_count_matches_increments() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        let mut expected = 0;
        for (round, fanout) in [(4, 1), (7, 30), (3, 10), (9, 64)] {
            for _ in 0..round {
                counter.increment(&ctx, "requests").await.unwrap();
                expected += 1;
            }
            counter.increase_shards(&ctx, "requests", fanout).await.unwrap();
        }

        assert_eq!(cold(&store).count(&ctx, "requests").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_fanout_is_max_of_requests_and_default() {
        let (_, _, counter) = service();
        let ctx = Context::new();

        let cases = [(1, 2), (5, 50), (50, 5), (30, 30), (0, 21), (64, 100)];
        for (i, (n1, n2)) in cases.into_iter().enumerate() {
            let name = format!("counter-{i}");
            counter.increase_shards(&ctx, &name, n1).await.unwrap();
            counter.increase_shards(&ctx, &name, n2).await.unwrap();
            assert_eq!(
                counter.shard_count(&ctx, &name).await.unwrap(),
                n1.max(n2).max(20),
                "case ({n1}, {n2})"
            );
        }
    }

    #[tokio::test]
    async fn test_increase_shards_writes_only_on_change() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        counter.increase_shards(&ctx, "visits", 1).await.unwrap();
        assert_eq!(store.commit_count(), 1, "default config persisted");

        counter.increase_shards(&ctx, "visits", 20).await.unwrap();
        counter.increase_shards(&ctx, "visits", 3).await.unwrap();
        assert_eq!(store.commit_count(), 1);

        counter.increase_shards(&ctx, "visits", 21).await.unwrap();
        assert_eq!(store.commit_count(), 2);
        assert_eq!(counter.stats().fanout_increases, 2);
    }

    #[tokio::test]
    async fn test_second_count_hits_cache() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        for _ in 0..4 {
            counter.increment(&ctx, "visits").await.unwrap();
        }

        let first = counter.count(&ctx, "visits").await.unwrap();
        assert_eq!(store.query_count(), 1);

        let second = counter.count(&ctx, "visits").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(store.query_count(), 1, "second count must not aggregate");

        let stats = counter.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.aggregations, 1);
    }

    #[tokio::test]
    async fn test_increment_bumps_cached_total() {
        let (store, cache, counter) = service();
        let ctx = Context::new();

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);

        counter.increment(&ctx, "visits").await.unwrap();
        counter.increment_by(&ctx, "visits", 5).await.unwrap();
        assert_eq!(cache.get(&ctx, "GeneralCounterShard:visits").await.unwrap(), Some(7));
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 7);
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn test_increment_never_creates_cache_entry() {
        let (_, cache, counter) = service();
        let ctx = Context::new();

        counter.increment(&ctx, "visits").await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&ctx, "GeneralCounterShard:visits").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expansion_keeps_history() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        for _ in 0..6 {
            counter.increment(&ctx, "visits").await.unwrap();
        }
        let before = counter.count(&ctx, "visits").await.unwrap();

        counter.increase_shards(&ctx, "visits", 50).await.unwrap();
        for _ in 0..10 {
            counter.increment(&ctx, "visits").await.unwrap();
        }

        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), before + 10);
        assert_eq!(cold(&store).count(&ctx, "visits").await.unwrap(), before + 10);
    }

    #[tokio::test]
    async fn test_shards_above_fanout_still_counted() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        counter.increase_shards(&ctx, "visits", 50).await.unwrap();
        counter.increment_shard(&ctx, "visits", 49).await.unwrap();
        counter.increment_shard(&ctx, "visits", 0).await.unwrap();

        let shards = counter.shard_store().shards(&ctx, "visits").await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(cold(&store).count(&ctx, "visits").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fixed_selector_routes_to_one_shard() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::uncached(Arc::clone(&store)).with_selector(FixedShard(7));
        let ctx = Context::new();

        for _ in 0..5 {
            counter.increment(&ctx, "visits").await.unwrap();
        }

        let shards = counter.shard_store().shards(&ctx, "visits").await.unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].0.name(), "shard7");
        assert_eq!(shards[0].1.count, 5);
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_different_shards_do_not_conflict() {
        let store = Arc::new(MemoryStore::new());
        let base = ShardedCounter::uncached(Arc::new(Rendezvous::new(Arc::clone(&store))));
        let ctx = Context::new();
        base.increase_shards(&ctx, "visits", 2).await.unwrap();

        increment_in_parallel(vec![
            base.clone().with_selector(FixedShard(0)),
            base.clone().with_selector(FixedShard(1)),
        ]);

        let shards = base.shard_store().shards(&ctx, "visits").await.unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|(_, shard)| shard.count == 1));
        assert_eq!(store.conflict_count(), 0);
    }

    #[tokio::test]
    async fn test_same_shard_conflicts_and_retries() {
        let store = Arc::new(MemoryStore::new());
        let base = ShardedCounter::uncached(Arc::new(Rendezvous::new(Arc::clone(&store))))
            .with_selector(FixedShard(0));
        let ctx = Context::new();
        base.increase_shards(&ctx, "visits", 2).await.unwrap();

        increment_in_parallel(vec![base.clone(), base.clone()]);

        let shards = base.shard_store().shards(&ctx, "visits").await.unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].1.count, 2);
        assert_eq!(store.conflict_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments() {
        let store = Arc::new(MemoryStore::with_settings(MemoryStoreSettings {
            max_attempts: 10_000,
            ..Default::default()
        }));
        let counter = ShardedCounter::new(Arc::clone(&store), Arc::new(MemoryCache::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let ctx = Context::new();
                for _ in 0..50 {
                    counter.increment(&ctx, "hits").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cold(&store).count(&Context::new(), "hits").await.unwrap(), 400);
        assert_eq!(counter.stats().increments, 400);
    }

    #[tokio::test]
    async fn test_racing_increment_heals_when_total_expires() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RacingSet {
            inner: MemoryCache::new(),
            other: ShardedCounter::uncached(Arc::clone(&store)),
            raced: AtomicBool::new(false),
        });
        let settings = CounterSettings::new().with_cache_ttl(Some(Duration::from_millis(50)));
        let counter = ShardedCounter::with_settings(Arc::clone(&store), cache, settings);
        let ctx = Context::new();

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);
        for _ in 0..5 {
            counter.increment(&ctx, "visits").await.unwrap();
        }
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 6, "short until expiry");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_interrupted_increment_still_invalidates() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CancelOnIncrement::default());
        let counter = ShardedCounter::new(Arc::clone(&store), Arc::clone(&cache));

        counter.increment(&Context::new(), "visits").await.unwrap();
        assert_eq!(counter.count(&Context::new(), "visits").await.unwrap(), 1);

        let ctx = Context::new();
        counter.increment(&ctx, "visits").await.unwrap();
        assert!(ctx.is_cancelled());

        let fresh = Context::new();
        assert_eq!(cache.get(&fresh, "GeneralCounterShard:visits").await.unwrap(), None);
        assert_eq!(counter.count(&fresh, "visits").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_count_tolerates_shard_written_mid_scan() {
        let store = Arc::new(MemoryStore::new());
        let late = ShardStore::new(Arc::clone(&store), CONFIG_KIND, SHARD_KIND).key("visits", 40);
        let late_value = serde_json::to_vec(&Shard {
            name: "visits".to_string(),
            count: 10,
        })
        .unwrap();
        let racing = Arc::new(LateShard {
            inner: Arc::clone(&store),
            late: parking_lot::Mutex::new(None),
        });
        let counter = ShardedCounter::uncached(Arc::clone(&racing)).with_selector(FixedShard(0));
        let ctx = Context::new();

        for _ in 0..3 {
            counter.increment(&ctx, "visits").await.unwrap();
        }
        *racing.late.lock() = Some((late, late_value));

        let total = counter.count(&ctx, "visits").await.unwrap();
        assert!(total == 3 || total == 13, "unexpected total {total}");
        assert!(racing.late.lock().is_none());
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_cache_outage_is_invisible() {
        let (_, cache, counter) = service();
        let ctx = Context::new();
        cache.set_unavailable(true);

        counter.increment(&ctx, "visits").await.unwrap();
        counter.increment(&ctx, "visits").await.unwrap();
        counter.increase_shards(&ctx, "visits", 40).await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 2);
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 2);

        assert!(counter.stats().cache_errors > 0);
        assert_eq!(counter.stats().cache_hits, 0);
    }

    #[tokio::test]
    async fn test_failed_cache_increment_invalidates() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(BrokenIncrements::default());
        let counter = ShardedCounter::new(Arc::clone(&store), Arc::clone(&cache));
        let ctx = Context::new();

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(cache.get(&ctx, "GeneralCounterShard:visits").await.unwrap(), None);
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_cache_increment_ignored() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(BrokenIncrements::default());
        let settings = CounterSettings::new().with_cache_failure_policy(CacheFailurePolicy::Ignore);
        let counter = ShardedCounter::with_settings(Arc::clone(&store), cache, settings);
        let ctx = Context::new();

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);

        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1, "stale until evicted");
        assert_eq!(cold(&store).count(&ctx, "visits").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_outage_is_returned() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        store.set_unavailable(true);

        assert!(matches!(
            counter.increment(&ctx, "visits").await,
            Err(CounterError::Store(StoreError::Unavailable(_)))
        ));
        assert!(matches!(
            counter.count(&ctx, "visits").await,
            Err(CounterError::Store(StoreError::Unavailable(_)))
        ));
        assert!(matches!(
            counter.increase_shards(&ctx, "visits", 5).await,
            Err(CounterError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_count_does_not_fill_cache() {
        let (store, cache, counter) = service();
        let ctx = Context::new();
        counter.increment(&ctx, "visits").await.unwrap();

        store.set_unavailable(true);
        assert!(counter.count(&ctx, "visits").await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_config_failure_touches_no_shard() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        store.fail_kind(Some(CONFIG_KIND));

        assert!(counter.increment(&ctx, "visits").await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shard_failure_leaves_config_initialized() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        store.fail_kind(Some(SHARD_KIND));

        assert!(counter.increment(&ctx, "visits").await.is_err());
        assert_eq!(
            counter.config_store().load(&ctx, "visits").await.unwrap(),
            Some(CounterConfig { shards: 20 })
        );

        store.fail_kind(None);
        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_retried_by_store() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        store.inject_conflicts(2);
        counter.increment(&ctx, "visits").await.unwrap();
        assert_eq!(counter.count(&ctx, "visits").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_surface() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        store.inject_conflicts(3);
        assert!(matches!(
            counter.increase_shards(&ctx, "visits", 30).await,
            Err(CounterError::Store(StoreError::ConflictRetriesExhausted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        ctx.cancel();

        assert!(matches!(
            counter.increment(&ctx, "visits").await,
            Err(CounterError::Store(StoreError::Cancelled))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let (_, _, counter) = service();
        let ctx = Context::new().with_timeout(Duration::ZERO);

        assert!(matches!(
            counter.count(&ctx, "visits").await,
            Err(CounterError::Store(StoreError::DeadlineExceeded(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let (store, _, counter) = service();
        let ctx = Context::new();

        assert!(matches!(
            counter.increment(&ctx, "").await,
            Err(CounterError::InvalidName)
        ));
        assert!(matches!(counter.count(&ctx, "").await, Err(CounterError::InvalidName)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_shard_out_of_range() {
        let (_, _, counter) = service();
        let ctx = Context::new();

        assert!(matches!(
            counter.increment_shard(&ctx, "visits", 20).await,
            Err(CounterError::InvalidShardIndex {
                index: 20,
                shard_count: 20
            })
        ));
        counter.increment_shard(&ctx, "visits", 19).await.unwrap();
    }

    #[tokio::test]
    async fn test_increment_by_zero_is_noop() {
        let (store, _, counter) = service();
        counter.increment_by(&Context::new(), "visits", 0).await.unwrap();
        assert!(store.is_empty());
        assert_eq!(counter.stats().increments, 0);
    }

    #[tokio::test]
    async fn test_shard_count_does_not_write() {
        let (store, _, counter) = service();
        let ctx = Context::new();
        assert_eq!(counter.shard_count(&ctx, "visits").await.unwrap(), 20);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_custom_settings() {
        let store = Arc::new(MemoryStore::new());
        let settings = CounterSettings::new()
            .with_default_shards(3)
            .with_kinds("PageViewConfig", "PageView");
        let counter = ShardedCounter::with_settings(
            Arc::clone(&store),
            Arc::new(MemoryCache::new()),
            settings,
        );
        let ctx = Context::new();

        counter.increment(&ctx, "home").await.unwrap();
        assert_eq!(counter.shard_count(&ctx, "home").await.unwrap(), 3);

        let shards = counter.shard_store().shards(&ctx, "home").await.unwrap();
        assert_eq!(shards[0].0.kind(), "PageView");
        assert_eq!(shards[0].0.parent().map(|p| p.kind()), Some("PageViewConfig"));
        assert_eq!(counter.count(&ctx, "home").await.unwrap(), 1);
    }
}

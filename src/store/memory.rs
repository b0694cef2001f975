//! In-process [`Datastore`] with optimistic per-key transactions.
//!
//! Records are spread over a fixed number of stripes, each a cache-padded
//! mutex around its own map, so writers to unrelated keys rarely touch the
//! same lock or the same cache line:
//!
//! ```text
//!   key ──hash──► stripe i ──► [CachePadded<Mutex<BTreeMap<Key, Versioned>>>]
//! ```
//!
//! A transaction snapshots the record and its version, runs the caller's
//! operation without holding any lock, and commits only if the version is
//! unchanged. On a mismatch it starts over, up to
//! [`MemoryStoreSettings::max_attempts`] times.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use crossbeam_utils::CachePadded;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::Context;
use crate::error::StoreError;
use crate::records::Key;
use crate::store::{Datastore, Entity, Mutation, Query, TxnOp};

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreSettings {
    /// Attempts per transaction before giving up on conflicts.
    pub max_attempts: u32,
    /// Number of lock stripes. Clamped to at least one.
    pub stripes: usize,
}

impl Default for MemoryStoreSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stripes: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct Versioned {
    value: Vec<u8>,
    version: u64,
}

type Stripe = CachePadded<Mutex<BTreeMap<Key, Versioned>>>;

/// In-memory transactional store.
///
/// Besides the [`Datastore`] operations it exposes fault injection
/// ([`set_unavailable`](Self::set_unavailable),
/// [`fail_kind`](Self::fail_kind), [`inject_conflicts`](Self::inject_conflicts))
/// and access counters for tests.
///
/// # Examples
///
/// ```rust
/// use contatori_store::context::Context;
/// use contatori_store::records::Key;
/// use contatori_store::store::{Datastore, MemoryStore};
///
/// # futures::executor::block_on(async {
/// let store = MemoryStore::new();
/// let ctx = Context::new();
/// let key = Key::new("Config", "visits");
///
/// store.put(&ctx, &key, br#"{"shards":4}"#.to_vec()).await.unwrap();
/// assert_eq!(store.get(&ctx, &key).await.unwrap(), Some(br#"{"shards":4}"#.to_vec()));
/// # });
/// ```
pub struct MemoryStore {
    stripes: Box<[Stripe]>,
    settings: MemoryStoreSettings,
    unavailable: AtomicBool,
    failing_kind: Mutex<Option<String>>,
    pending_conflicts: AtomicU32,
    queries: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_settings(MemoryStoreSettings::default())
    }
}

impl MemoryStore {
    /// Creates an empty store with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with the given settings.
    pub fn with_settings(settings: MemoryStoreSettings) -> Self {
        let stripes = (0..settings.stripes.max(1))
            .map(|_| CachePadded::new(Mutex::new(BTreeMap::new())))
            .collect();
        Self {
            stripes,
            settings: MemoryStoreSettings {
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
            unavailable: AtomicBool::new(false),
            failing_kind: Mutex::new(None),
            pending_conflicts: AtomicU32::new(0),
            queries: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Makes every operation fail with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Makes operations on keys of `kind` fail with [`StoreError::Unavailable`].
    /// `None` clears it.
    pub fn fail_kind(&self, kind: Option<&str>) {
        *self.failing_kind.lock() = kind.map(str::to_string);
    }

    /// Forces the next `n` transaction commits to conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::Relaxed);
    }

    /// Number of queries run so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of writes committed so far, by `put` or by transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of transaction attempts that conflicted and were retried or
    /// abandoned, injected conflicts included.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|stripe| stripe.lock().len()).sum()
    }

    /// Returns `true` if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stripe(&self, key: &Key) -> &Stripe {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn check(&self, ctx: &Context, kind: &str) -> Result<(), StoreError> {
        ctx.check()?;
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        if self.failing_kind.lock().as_deref() == Some(kind) {
            return Err(StoreError::Unavailable(format!("kind {kind} offline")));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn scan(&self, query: &Query) -> Vec<Result<Entity, StoreError>> {
        let mut out = Vec::new();
        for stripe in self.stripes.iter() {
            let guard = stripe.lock();
            for (key, record) in guard.iter().filter(|(key, _)| query.matches_key(key)) {
                match query.matches_value(&record.value) {
                    Ok(true) => out.push(Ok(Entity {
                        key: key.clone(),
                        value: record.value.clone(),
                    })),
                    Ok(false) => {}
                    Err(source) => out.push(Err(StoreError::Corrupt {
                        key: key.to_string(),
                        source,
                    })),
                }
            }
        }
        out
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn get(&self, ctx: &Context, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(ctx, key.kind())?;
        Ok(self.stripe(key).lock().get(key).map(|record| record.value.clone()))
    }

    async fn put(&self, ctx: &Context, key: &Key, value: Vec<u8>) -> Result<(), StoreError> {
        self.check(ctx, key.kind())?;
        let mut guard = self.stripe(key).lock();
        let version = guard.get(key).map_or(0, |record| record.version);
        guard.insert(
            key.clone(),
            Versioned {
                value,
                version: version + 1,
            },
        );
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn run_in_transaction(
        &self,
        ctx: &Context,
        key: &Key,
        op: &mut TxnOp<'_>,
    ) -> Result<(), StoreError> {
        let stripe = self.stripe(key);
        let attempts = self.settings.max_attempts;

        for attempt in 1..=attempts {
            self.check(ctx, key.kind())?;

            let (snapshot, version) = match stripe.lock().get(key) {
                Some(record) => (Some(record.value.clone()), record.version),
                None => (None, 0),
            };

            let value = match op(snapshot.as_deref())? {
                Mutation::Keep => return Ok(()),
                Mutation::Put(value) => value,
            };

            if !self.take_injected_conflict() {
                let mut guard = stripe.lock();
                if guard.get(key).map_or(0, |record| record.version) == version {
                    guard.insert(
                        key.clone(),
                        Versioned {
                            value,
                            version: version + 1,
                        },
                    );
                    self.commits.fetch_add(1, Ordering::Relaxed);
                    trace!(%key, version = version + 1, attempt, "transaction committed");
                    return Ok(());
                }
            }

            self.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(%key, attempt, "transaction conflict");
        }

        Err(StoreError::ConflictRetriesExhausted {
            key: key.to_string(),
            attempts,
        })
    }

    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: Query,
    ) -> BoxStream<'a, Result<Entity, StoreError>> {
        if let Err(err) = self.check(ctx, &query.kind) {
            return stream::once(async move { Err(err) }).boxed();
        }
        self.queries.fetch_add(1, Ordering::Relaxed);
        stream::iter(self.scan(&query)).boxed()
    }
}

//! # Contatori Store - Sharded Counters over a Transactional Store
//!
//! A Rust library for named counters that tolerate high write concurrency
//! when backed by a datastore whose per-record write throughput is limited
//! and which serializes conflicting transactions on the same record.
//!
//! ## The Problem
//!
//! A counter kept in a single record turns every increment into a
//! read-modify-write transaction on that record. Under concurrent load the
//! transactions conflict, retry and eventually fail, and throughput caps at
//! what one record can absorb.
//!
//! ## The Solution: Sharded Counters
//!
//! Each named counter is split into `N` shard records (the *fan-out*, 20 by
//! default). An increment picks one shard at random and updates only that
//! record, so concurrent increments rarely touch the same record. Reading the
//! counter sums every shard, and the sum is kept in a best-effort cache so
//! repeated reads do not re-aggregate.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   increment ─────► │ Config:visits  {"shards":20} │  lazily created, only grows
//!        │           └──────────────────────────────┘
//!        │ random i            │ parent of
//!        ▼                     ▼
//!   ┌─────────┐ ┌─────────┐       ┌──────────┐
//!   │ shard0  │ │ shard1  │  ...  │ shard19  │   one transaction per increment
//!   └─────────┘ └─────────┘       └──────────┘
//!        └───────────┴──── sum ───────┘
//!                          │
//!   count ◄── cache ◄──────┘  cache-aside, never authoritative
//! ```
//!
//! ### Design Principles
//!
//! 1. **One record per transaction**: lazy config creation, fan-out changes
//!    and shard increments are each a transaction scoped to a single record.
//!
//! 2. **Monotonic fan-out**: [`increase_shards`](ShardedCounter::increase_shards)
//!    only ever raises the fan-out. Aggregation finds shards by ancestry, not
//!    by index, so shards written before an expansion keep being counted.
//!
//! 3. **The cache is a hint**: cache failures are logged and ignored. An
//!    increment only adjusts a cached total that already exists; it never
//!    creates one.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use contatori_store::{Context, MemoryCache, MemoryStore, ShardedCounter};
//!
//! # futures::executor::block_on(async {
//! let counter = ShardedCounter::new(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
//! let ctx = Context::new();
//!
//! counter.increment(&ctx, "visits").await?;
//! counter.increment_by(&ctx, "visits", 4).await?;
//!
//! assert_eq!(counter.count(&ctx, "visits").await?, 5);
//! # Ok::<(), contatori_store::CounterError>(())
//! # }).unwrap();
//! ```
//!
//! ## Backends
//!
//! The service is generic over two collaborators:
//!
//! | Trait | In-memory implementation | Role |
//! |-------|--------------------------|------|
//! | [`Datastore`] | [`MemoryStore`] | Authoritative records, single-record transactions, ancestor queries |
//! | [`Cache`] | [`MemoryCache`], [`NoCache`] | Best-effort aggregate totals |
//!
//! Every call takes a [`Context`] carrying cancellation and a deadline, which
//! the service forwards to each backend call.
//!
//! ## Observers
//!
//! | Feature | Module | Description |
//! |---------|--------|-------------|
//! | `prometheus` | `observers::prometheus` | Export service statistics in Prometheus exposition format |
//! | `full` | All observers | Enables all observer modules |

pub mod cache;
pub mod config_store;
pub mod context;
pub mod error;
pub mod records;
pub mod selector;
pub mod service;
pub mod settings;
pub mod shard_store;
pub mod snapshot;
pub mod stats;
pub mod store;

#[cfg(feature = "prometheus")]
pub mod observers;

pub use cache::{Cache, MemoryCache, NoCache};
pub use context::Context;
pub use error::{CacheError, CounterError, Result, StoreError};
pub use selector::{FixedShard, RandomShard, ShardSelector};
pub use service::ShardedCounter;
pub use settings::{CacheFailurePolicy, CounterSettings};
pub use snapshot::StatsSnapshot;
pub use store::{Datastore, MemoryStore, MemoryStoreSettings};

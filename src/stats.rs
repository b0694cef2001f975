//! In-process activity counters for the counter service.
//!
//! The service counts cache hits, aggregations and increments on the same hot
//! path as the increments themselves. A single atomic per statistic would make
//! every concurrent caller bounce the same cache line, so each statistic is a
//! small sharded counter: every thread writes its own cache-padded slot and a
//! read sums the slots.
//!
//! ```text
//!   Thread 0 ──add──►  [Slot 0] (CachePadded<AtomicU64>)
//!   Thread 1 ──add──►  [Slot 1] (CachePadded<AtomicU64>)
//!      ...                ...
//!   Thread 15 ─add──►  [Slot 15]
//!                         │
//!                         ▼
//!                   value() sums all slots
//! ```
//!
//! These numbers are diagnostics. They live only in this process, are never
//! persisted, and never influence what an operation returns.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::snapshot::StatsSnapshot;

/// Slots per statistic.
const NUM_SLOTS: usize = 16;

static NEXT_SLOT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Slot assigned to the current thread, round-robin on first use.
    static THREAD_SLOT_INDEX: usize = NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed) % NUM_SLOTS;
}

/// A monotone counter sharded across per-thread slots.
pub(crate) struct SlotCounter {
    slots: [CachePadded<AtomicU64>; NUM_SLOTS],
}

impl SlotCounter {
    pub(crate) const fn new() -> Self {
        const ZERO: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));
        Self {
            slots: [ZERO; NUM_SLOTS],
        }
    }

    #[inline]
    pub(crate) fn add(&self, value: u64) {
        THREAD_SLOT_INDEX.with(|idx| self.slots[*idx].fetch_add(value, Ordering::Relaxed));
    }

    #[inline]
    pub(crate) fn incr(&self) {
        self.add(1);
    }

    pub(crate) fn value(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for SlotCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Activity counters for one [`ShardedCounter`](crate::service::ShardedCounter).
#[derive(Default)]
pub struct ServiceStats {
    pub(crate) cache_hits: SlotCounter,
    pub(crate) cache_misses: SlotCounter,
    pub(crate) cache_errors: SlotCounter,
    pub(crate) aggregations: SlotCounter,
    pub(crate) increments: SlotCounter,
    pub(crate) fanout_increases: SlotCounter,
}

impl ServiceStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every statistic.
    ///
    /// Each value is read independently, so a snapshot taken under load is
    /// not a single consistent cut.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.value(),
            cache_misses: self.cache_misses.value(),
            cache_errors: self.cache_errors.value(),
            aggregations: self.aggregations.value(),
            increments: self.increments.value(),
            fanout_increases: self.fanout_increases.value(),
        }
    }
}

impl std::fmt::Debug for ServiceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

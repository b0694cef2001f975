//! Error types for the counter service and its collaborators.
//!
//! The taxonomy mirrors how each failure is handled:
//!
//! - [`StoreError`] comes from the authoritative [`Datastore`](crate::store::Datastore)
//!   and is always surfaced to the caller, wrapped in [`CounterError::Store`].
//! - [`CacheError`] comes from the [`Cache`](crate::cache::Cache) and is never
//!   surfaced: the service logs it and carries on.
//! - A missing record is not an error at all; stores return `Ok(None)`.
//!
//! # Example
//!
//! ```rust
//! use contatori_store::error::{CounterError, StoreError};
//!
//! let err = CounterError::from(StoreError::Unavailable("connection refused".into()));
//! assert_eq!(err.to_string(), "store error: store unavailable: connection refused");
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transactional key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A transaction kept conflicting with concurrent writers.
    #[error("transaction on {key} conflicted {attempts} times, giving up")]
    ConflictRetriesExhausted {
        /// The key the transaction was scoped to.
        key: String,
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        /// The key of the offending record.
        key: String,
        /// The underlying decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the store answered.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Errors raised by the best-effort cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache could not be reached or refused the request.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the cache answered.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Errors returned by [`ShardedCounter`](crate::service::ShardedCounter).
#[derive(Debug, Error)]
pub enum CounterError {
    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Counter names must be non-empty.
    #[error("invalid counter name: must not be empty")]
    InvalidName,

    /// A forced shard index fell outside the counter's fan-out.
    #[error("shard index {index} out of range for fan-out {shard_count}")]
    InvalidShardIndex {
        /// The requested index.
        index: u32,
        /// The counter's current fan-out.
        shard_count: u32,
    },
}

/// Result type for counter service operations.
pub type Result<T> = std::result::Result<T, CounterError>;

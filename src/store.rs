//! The transactional key-value store the counters persist to.
//!
//! [`Datastore`] is the seam to the authoritative backend. Implementations
//! must give each [`run_in_transaction`](Datastore::run_in_transaction) call
//! serializable isolation on its key and retry the operation on write
//! conflicts; the service itself never retries.
//!
//! [`MemoryStore`] is an in-process implementation used by tests, benches and
//! single-process deployments.

mod memory;

pub use memory::{MemoryStore, MemoryStoreSettings};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::context::Context;
use crate::error::StoreError;
use crate::records::Key;

/// Outcome of one attempt of a transactional operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Commit without writing.
    Keep,
    /// Write these bytes to the transaction's key.
    Put(Vec<u8>),
}

/// A read-modify-write step run inside a transaction.
///
/// The argument is the record as read within the transaction, `None` if it
/// does not exist. The step may be invoked several times when the store
/// retries on conflict, so it must not have side effects beyond what it
/// returns and what it records for the caller.
pub type TxnOp<'a> = dyn FnMut(Option<&[u8]>) -> Result<Mutation, StoreError> + Send + 'a;

/// A record returned by a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// The record's key.
    pub key: Key,
    /// The serialized record.
    pub value: Vec<u8>,
}

/// Selects records by kind, ancestor and property equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Record kind to return.
    pub kind: String,
    /// If set, only records at or under this key are returned.
    pub ancestor: Option<Key>,
    /// Property name/value pairs that must all match.
    pub filters: Vec<(String, Value)>,
}

impl Query {
    /// Creates a query for every record of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            filters: Vec::new(),
        }
    }

    /// Restricts the query to records under `ancestor`.
    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    /// Adds an equality filter on a top-level property.
    pub fn filter_eq(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.filters.push((property.to_string(), value.into()));
        self
    }

    /// Returns `true` if the key's kind and ancestry match this query.
    pub fn matches_key(&self, key: &Key) -> bool {
        key.kind() == self.kind
            && self
                .ancestor
                .as_ref()
                .map_or(true, |ancestor| key.has_ancestor(ancestor))
    }

    /// Returns `true` if the serialized record satisfies every filter.
    ///
    /// Fails if the record is not a JSON object.
    pub fn matches_value(&self, value: &[u8]) -> Result<bool, serde_json::Error> {
        if self.filters.is_empty() {
            return Ok(true);
        }
        let record: serde_json::Map<String, Value> = serde_json::from_slice(value)?;
        Ok(self
            .filters
            .iter()
            .all(|(property, expected)| record.get(property) == Some(expected)))
    }
}

/// Transactional key-value store.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Reads a record. A missing record is `Ok(None)`.
    async fn get(&self, ctx: &Context, key: &Key) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes a record unconditionally.
    async fn put(&self, ctx: &Context, key: &Key, value: Vec<u8>) -> Result<(), StoreError>;

    /// Runs `op` as a serializable read-modify-write on `key`.
    ///
    /// On a write conflict the store re-reads the record and invokes `op`
    /// again, up to its own attempt limit, after which it fails with
    /// [`StoreError::ConflictRetriesExhausted`].
    async fn run_in_transaction(
        &self,
        ctx: &Context,
        key: &Key,
        op: &mut TxnOp<'_>,
    ) -> Result<(), StoreError>;

    /// Streams every record matching `query`.
    ///
    /// The stream is finite. Records written while it is being consumed may
    /// or may not be included; running the query again restarts it.
    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: Query,
    ) -> BoxStream<'a, Result<Entity, StoreError>>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    async fn get(&self, ctx: &Context, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(ctx, key).await
    }

    async fn put(&self, ctx: &Context, key: &Key, value: Vec<u8>) -> Result<(), StoreError> {
        (**self).put(ctx, key, value).await
    }

    async fn run_in_transaction(
        &self,
        ctx: &Context,
        key: &Key,
        op: &mut TxnOp<'_>,
    ) -> Result<(), StoreError> {
        (**self).run_in_transaction(ctx, key, op).await
    }

    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: Query,
    ) -> BoxStream<'a, Result<Entity, StoreError>> {
        (**self).query(ctx, query)
    }
}

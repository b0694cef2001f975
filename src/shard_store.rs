//! Per-shard partial counts and their aggregation.

use std::sync::Arc;

use futures::TryStreamExt;

use crate::context::Context;
use crate::error::StoreError;
use crate::records::{decode, encode, Key, Shard, SHARD_NAME_PROPERTY};
use crate::store::{Datastore, Mutation, Query};

/// Typed access to [`Shard`] records.
///
/// Shard keys are children of the counter's config key:
/// `Config:name/Shard:shard{index}`.
pub struct ShardStore<S> {
    store: Arc<S>,
    config_kind: String,
    shard_kind: String,
}

impl<S> Clone for ShardStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config_kind: self.config_kind.clone(),
            shard_kind: self.shard_kind.clone(),
        }
    }
}

impl<S: Datastore> ShardStore<S> {
    /// Creates a shard store for shards of `shard_kind` parented under
    /// config records of `config_kind`.
    pub fn new(
        store: Arc<S>,
        config_kind: impl Into<String>,
        shard_kind: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config_kind: config_kind.into(),
            shard_kind: shard_kind.into(),
        }
    }

    fn parent(&self, name: &str) -> Key {
        Key::new(self.config_kind.as_str(), name)
    }

    /// Key of shard `index` of counter `name`.
    pub fn key(&self, name: &str, index: u32) -> Key {
        Key::new(self.shard_kind.as_str(), format!("shard{index}")).with_parent(self.parent(name))
    }

    /// Adds `delta` to shard `index` of `name` in a transaction scoped to
    /// that shard. A missing shard starts from zero.
    ///
    /// Returns the shard as committed.
    pub async fn increment(
        &self,
        ctx: &Context,
        name: &str,
        index: u32,
        delta: u64,
    ) -> Result<Shard, StoreError> {
        let key = self.key(name, index);
        let mut committed = Shard::default();

        self.store
            .run_in_transaction(ctx, &key, &mut |current| {
                let mut shard = match current {
                    Some(bytes) => decode::<Shard>(&key, bytes)?,
                    None => Shard::default(),
                };
                shard.count = shard.count.saturating_add(delta);
                shard.name = name.to_string();
                let bytes = encode(&key, &shard)?;
                committed = shard;
                Ok(Mutation::Put(bytes))
            })
            .await?;

        Ok(committed)
    }

    /// Lists every shard recorded for `name`, at any index.
    pub async fn shards(&self, ctx: &Context, name: &str) -> Result<Vec<(Key, Shard)>, StoreError> {
        self.store
            .query(ctx, self.query(name))
            .and_then(|entity| async move {
                let shard = decode::<Shard>(&entity.key, &entity.value)?;
                Ok::<_, StoreError>((entity.key, shard))
            })
            .try_collect()
            .await
    }

    /// Sums the counts of every shard recorded for `name`.
    ///
    /// Having no shards is not an error: the total is zero. Shards above the
    /// current fan-out are included, so raising the fan-out never hides
    /// history.
    pub async fn total(&self, ctx: &Context, name: &str) -> Result<u64, StoreError> {
        self.store
            .query(ctx, self.query(name))
            .try_fold(0u64, |total, entity| async move {
                let shard = decode::<Shard>(&entity.key, &entity.value)?;
                Ok::<_, StoreError>(total.saturating_add(shard.count))
            })
            .await
    }

    fn query(&self, name: &str) -> Query {
        Query::new(self.shard_kind.as_str())
            .ancestor(self.parent(name))
            .filter_eq(SHARD_NAME_PROPERTY, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn shard_store() -> (Arc<MemoryStore>, ShardStore<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let shards = ShardStore::new(
            Arc::clone(&store),
            "GeneralCounterShardConfig",
            "GeneralCounterShard",
        );
        (store, shards)
    }

    #[test]
    fn test_key_layout() {
        let (_, shards) = shard_store();
        assert_eq!(
            shards.key("visits", 7).to_string(),
            "GeneralCounterShardConfig:visits/GeneralCounterShard:shard7"
        );
    }

    #[tokio::test]
    async fn test_total_empty() {
        let (_, shards) = shard_store();
        assert_eq!(shards.total(&Context::new(), "visits").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_creates_then_accumulates() {
        let (_, shards) = shard_store();
        let ctx = Context::new();

        let shard = shards.increment(&ctx, "visits", 2, 1).await.unwrap();
        assert_eq!(
            shard,
            Shard {
                name: "visits".to_string(),
                count: 1
            }
        );
        let shard = shards.increment(&ctx, "visits", 2, 4).await.unwrap();
        assert_eq!(shard.count, 5);
    }

    #[tokio::test]
    async fn test_total_sums_only_own_shards() {
        let (_, shards) = shard_store();
        let ctx = Context::new();

        shards.increment(&ctx, "visits", 0, 1).await.unwrap();
        shards.increment(&ctx, "visits", 3, 2).await.unwrap();
        shards.increment(&ctx, "visits", 49, 3).await.unwrap();
        shards.increment(&ctx, "clicks", 0, 100).await.unwrap();

        assert_eq!(shards.total(&ctx, "visits").await.unwrap(), 6);
        assert_eq!(shards.total(&ctx, "clicks").await.unwrap(), 100);
        assert_eq!(shards.shards(&ctx, "visits").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_total_propagates_store_errors() {
        let (store, shards) = shard_store();
        let ctx = Context::new();
        shards.increment(&ctx, "visits", 0, 1).await.unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            shards.total(&ctx, "visits").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_total_rejects_corrupt_shard() {
        let (store, shards) = shard_store();
        let ctx = Context::new();
        store
            .put(&ctx, &shards.key("visits", 1), br#"{"name":"visits","count":"x"}"#.to_vec())
            .await
            .unwrap();

        assert!(matches!(
            shards.total(&ctx, "visits").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}

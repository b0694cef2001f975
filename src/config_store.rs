//! Per-counter fan-out records.

use std::sync::Arc;

use crate::context::Context;
use crate::error::StoreError;
use crate::records::{decode, encode, CounterConfig, Key};
use crate::store::{Datastore, Mutation};

/// Typed access to [`CounterConfig`] records.
///
/// Every write goes through a transaction scoped to the one config record, so
/// concurrent lazy creation and concurrent fan-out increases settle on a
/// single value.
pub struct ConfigStore<S> {
    store: Arc<S>,
    kind: String,
    default_shards: u32,
}

impl<S> Clone for ConfigStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kind: self.kind.clone(),
            default_shards: self.default_shards,
        }
    }
}

impl<S: Datastore> ConfigStore<S> {
    /// Creates a config store writing records of `kind`.
    pub fn new(store: Arc<S>, kind: impl Into<String>, default_shards: u32) -> Self {
        Self {
            store,
            kind: kind.into(),
            default_shards: default_shards.max(1),
        }
    }

    /// Key of the config record for `name`.
    pub fn key(&self, name: &str) -> Key {
        Key::new(self.kind.as_str(), name)
    }

    /// Fan-out given to newly created configs.
    pub fn default_shards(&self) -> u32 {
        self.default_shards
    }

    /// Reads the config for `name` without creating it.
    pub async fn load(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<Option<CounterConfig>, StoreError> {
        let key = self.key(name);
        self.store
            .get(ctx, &key)
            .await?
            .map(|bytes| decode(&key, &bytes))
            .transpose()
    }

    /// Reads the config for `name`, creating it with the default fan-out if
    /// it does not exist yet.
    pub async fn get_or_init(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<CounterConfig, StoreError> {
        self.update(ctx, name, |_| None).await.map(|(config, _)| config)
    }

    /// Raises the fan-out for `name` to at least `shards`, creating the
    /// config first if needed. Never lowers it.
    ///
    /// Returns the resulting config and whether anything was written.
    pub async fn raise(
        &self,
        ctx: &Context,
        name: &str,
        shards: u32,
    ) -> Result<(CounterConfig, bool), StoreError> {
        self.update(ctx, name, |current| {
            (current.shards < shards).then_some(CounterConfig { shards })
        })
        .await
    }

    /// Transactional get-or-default followed by an optional change.
    ///
    /// `change` sees the existing (or freshly defaulted) config and returns a
    /// replacement, or `None` to leave it. The record is written only if it
    /// was created or changed.
    async fn update<F>(
        &self,
        ctx: &Context,
        name: &str,
        change: F,
    ) -> Result<(CounterConfig, bool), StoreError>
    where
        F: Fn(&CounterConfig) -> Option<CounterConfig> + Send + Sync,
    {
        let key = self.key(name);
        let default = CounterConfig {
            shards: self.default_shards,
        };
        let mut outcome = (default, false);

        self.store
            .run_in_transaction(ctx, &key, &mut |current| {
                let (mut config, mut modified) = match current {
                    Some(bytes) => (decode::<CounterConfig>(&key, bytes)?, false),
                    None => (default, true),
                };
                if let Some(changed) = change(&config) {
                    config = changed;
                    modified = true;
                }
                outcome = (config, modified);
                if modified {
                    Ok(Mutation::Put(encode(&key, &config)?))
                } else {
                    Ok(Mutation::Keep)
                }
            })
            .await?;

        Ok(outcome)
    }
}

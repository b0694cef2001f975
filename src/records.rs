//! Persisted record types and their keys.
//!
//! Two record kinds live in the store:
//!
//! ```text
//!   GeneralCounterShardConfig:visits                       {"shards":20}
//!     └── GeneralCounterShard:shard0                       {"name":"visits","count":3}
//!     └── GeneralCounterShard:shard7                       {"name":"visits","count":1}
//!     └── ...
//! ```
//!
//! Shards are children of their counter's config key, so an ancestor query on
//! the config key finds every shard ever written for that counter, including
//! shards above the current fan-out.

use std::fmt::{self, Display};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Hierarchical record key: a kind, a name, and an optional parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    kind: String,
    name: String,
    parent: Option<Box<Key>>,
}

impl Key {
    /// Creates a root key.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            parent: None,
        }
    }

    /// Places this key under `parent`.
    pub fn with_parent(self, parent: Key) -> Self {
        Self {
            parent: Some(Box::new(parent)),
            ..self
        }
    }

    /// The record kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The record name, unique among siblings of the same kind.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent key, if any.
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    /// Returns `true` if `ancestor` is this key or one of its parents.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }
}

impl Display for Key {
    /// Formats as `Kind:name`, prefixed by the parent path: `Parent:p/Kind:name`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}/")?;
        }
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Per-counter configuration: the current shard fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Number of shards increments are spread across. Never decreases.
    pub shards: u32,
}

/// One partial count of a counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Name of the owning counter, kept on the record for aggregation queries.
    pub name: String,
    /// Partial count. Never decreases.
    pub count: u64,
}

/// Property of [`Shard`] holding the owning counter's name.
pub const SHARD_NAME_PROPERTY: &str = "name";

pub(crate) fn encode<T: Serialize>(key: &Key, record: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &Key, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

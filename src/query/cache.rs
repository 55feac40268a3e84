//! Entity cache consulted for unique lookups.
//!
//! Selects that bind a full unique combination by equality may be answered
//! from this cache instead of the store, which smooths over the store's
//! eventually consistent queries right after a write. The query path only
//! reads; population belongs to the write path.

use std::hash::Hasher;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;

use crate::query::{
    datastore::Entity,
    model::ModelMeta,
    unique::{unique_keys_for, CacheKey},
};

/// Failure reading from a cache backend. Never fatal to a query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Backend could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    /// Stored payload was unreadable.
    #[error("cached entity could not be decoded: {0}")]
    Corrupt(String),
}

/// Read side of the entity cache.
pub trait EntityCache: Send + Sync {
    /// Looks up the entity stored under `key`.
    fn get(&self, key: &CacheKey) -> Result<Option<Entity>, CacheError>;
}

/// Cache that never holds anything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoCache;

impl EntityCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Entity>, CacheError> {
        Ok(None)
    }
}

/// Sharded in-process LRU cache.
pub struct LruEntityCache {
    shards: Vec<Mutex<LruCache<CacheKey, Entity>>>,
}

impl LruEntityCache {
    /// Creates a cache of roughly `capacity` entries spread over `shards`.
    pub fn new(shards: usize, capacity: usize) -> Self {
        let shard_count = shards.max(1);
        let per_shard = NonZeroUsize::new((capacity / shard_count).max(1)).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self { shards }
    }

    /// Stores `entity` under `key`.
    pub fn put(&self, key: CacheKey, entity: Entity) {
        self.shard_for(&key).lock().put(key, entity);
    }

    /// Drops the entry under `key`.
    pub fn invalidate(&self, key: &CacheKey) {
        self.shard_for(key).lock().pop(key);
    }

    /// Stores `entity` under every unique combination it populates.
    /// Returns the number of keys written.
    pub fn cache_entity(&self, model: &ModelMeta, entity: &Entity) -> usize {
        let keys = entity_keys(model, entity);
        let written = keys.len();
        for key in keys {
            self.put(key, entity.clone());
        }
        written
    }

    /// Removes `entity` from every unique combination it populates.
    pub fn uncache_entity(&self, model: &ModelMeta, entity: &Entity) {
        for key in entity_keys(model, entity) {
            self.invalidate(&key);
        }
    }

    /// Number of cached entries across shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every shard.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    fn shard_for(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, Entity>> {
        let mut hasher = Xxh64::new(0);
        hasher.write(key.as_str().as_bytes());
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

impl Default for LruEntityCache {
    fn default() -> Self {
        Self::new(8, 4096)
    }
}

impl EntityCache for LruEntityCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Entity>, CacheError> {
        Ok(self.shard_for(key).lock().get(key).cloned())
    }
}

fn entity_keys(model: &ModelMeta, entity: &Entity) -> Vec<CacheKey> {
    unique_keys_for(model, |column| {
        if model.is_pk(column) {
            Some(&entity.key)
        } else {
            entity.properties.get(column).filter(|value| !value.is_null())
        }
    })
}

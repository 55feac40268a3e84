//! Backing-store boundary and an in-memory reference store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::query::{
    filters::{compare_entities, matches_all},
    physical::{QuerySpec, KEY_PROPERTY},
    value::Value,
};

/// Record returned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Kind (table) the entity lives in.
    pub kind: String,
    /// Entity key.
    pub key: Value,
    /// Stored properties.
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    /// Entity with no properties.
    pub fn new(kind: impl Into<String>, key: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Reads a property; [`KEY_PROPERTY`] yields the key.
    pub fn get(&self, property: &str) -> Option<&Value> {
        if property == KEY_PROPERTY {
            Some(&self.key)
        } else {
            self.properties.get(property)
        }
    }

    /// Copy restricted to `properties`.
    pub fn project(&self, properties: &[String]) -> Entity {
        Entity {
            kind: self.kind.clone(),
            key: self.key.clone(),
            properties: properties
                .iter()
                .filter_map(|name| Some((name.clone(), self.properties.get(name)?.clone())))
                .collect(),
        }
    }

    /// Copy carrying only the key.
    pub fn key_only(&self) -> Entity {
        Entity::new(self.kind.clone(), self.key.clone())
    }
}

/// Lazily produced, finite entity sequence.
pub type EntityStream = Box<dyn Iterator<Item = Result<Entity, StoreError>> + Send>;

/// Failure reported by the backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    /// The store refused the query shape.
    #[error("datastore rejected query: {0}")]
    BadQuery(String),
    /// The call exceeded its deadline.
    #[error("datastore call timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "StoreUnavailable",
            StoreError::BadQuery(_) => "StoreBadQuery",
            StoreError::Timeout(_) => "StoreTimeout",
        }
    }
}

/// Operations the query engine needs from a store.
pub trait Datastore: Send + Sync {
    /// Runs one physical query.
    fn run(&self, spec: &QuerySpec) -> Result<EntityStream, StoreError>;
    /// Counts matches of one physical query, honoring its limit and offset.
    fn count(&self, spec: &QuerySpec) -> Result<u64, StoreError>;
    /// Fetches entities by key; missing keys are skipped.
    fn get(&self, kind: &str, keys: &[Value]) -> Result<Vec<Entity>, StoreError>;
    /// Deletes entities by key, returning how many existed.
    fn delete(&self, kind: &str, keys: &[Value]) -> Result<usize, StoreError>;
}

/// Calls observed by a [`MemoryDatastore`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    /// `run` calls.
    pub run: usize,
    /// `count` calls.
    pub count: usize,
    /// `get` calls.
    pub get: usize,
    /// `delete` calls.
    pub delete: usize,
}

impl StoreCallCounts {
    /// Sum of query calls (`run` and `count`).
    pub fn queries(&self) -> usize {
        self.run + self.count
    }
}

#[derive(Default)]
struct CallCounters {
    run: AtomicUsize,
    count: AtomicUsize,
    get: AtomicUsize,
    delete: AtomicUsize,
}

/// Store keeping every kind in memory.
///
/// Enforces the single-inequality-property rule so plans that a real store
/// would reject fail here too.
#[derive(Default)]
pub struct MemoryDatastore {
    kinds: RwLock<BTreeMap<String, BTreeMap<String, Entity>>>,
    calls: CallCounters,
}

impl MemoryDatastore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity.
    pub fn put(&self, entity: Entity) {
        self.kinds
            .write()
            .entry(entity.kind.clone())
            .or_default()
            .insert(entity.key.sort_key(), entity);
    }

    /// Inserts or replaces several entities.
    pub fn put_all(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut kinds = self.kinds.write();
        for entity in entities {
            kinds
                .entry(entity.kind.clone())
                .or_default()
                .insert(entity.key.sort_key(), entity);
        }
    }

    /// Number of stored entities of `kind`.
    pub fn len(&self, kind: &str) -> usize {
        self.kinds.read().get(kind).map_or(0, BTreeMap::len)
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> StoreCallCounts {
        StoreCallCounts {
            run: self.calls.run.load(Ordering::Relaxed),
            count: self.calls.count.load(Ordering::Relaxed),
            get: self.calls.get.load(Ordering::Relaxed),
            delete: self.calls.delete.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the call counters.
    pub fn reset_calls(&self) {
        self.calls.run.store(0, Ordering::Relaxed);
        self.calls.count.store(0, Ordering::Relaxed);
        self.calls.get.store(0, Ordering::Relaxed);
        self.calls.delete.store(0, Ordering::Relaxed);
    }

    fn evaluate(&self, spec: &QuerySpec) -> Result<Vec<Entity>, StoreError> {
        let inequalities = spec.inequality_properties();
        if inequalities.len() > 1 {
            return Err(StoreError::BadQuery(format!(
                "inequality filters on multiple properties: {}",
                inequalities.join(", ")
            )));
        }
        let kinds = self.kinds.read();
        let mut rows: Vec<Entity> = kinds
            .get(&spec.kind)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|entity| matches_all(entity, &spec.filters))
            .filter(|entity| {
                spec.projection
                    .as_ref()
                    .map_or(true, |props| props.iter().all(|p| entity.properties.contains_key(p)))
            })
            .cloned()
            .collect();
        drop(kinds);
        rows.sort_by(|a, b| compare_entities(a, b, &spec.ordering));
        let rows = rows
            .into_iter()
            .skip(spec.offset)
            .take(spec.limit.unwrap_or(usize::MAX));
        Ok(match (&spec.projection, spec.keys_only) {
            (_, true) => rows.map(|entity| entity.key_only()).collect(),
            (Some(props), false) => rows.map(|entity| entity.project(props)).collect(),
            (None, false) => rows.collect(),
        })
    }
}

impl Datastore for MemoryDatastore {
    fn run(&self, spec: &QuerySpec) -> Result<EntityStream, StoreError> {
        self.calls.run.fetch_add(1, Ordering::Relaxed);
        trace!(query = %spec, "memory store run");
        let rows = self.evaluate(spec)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn count(&self, spec: &QuerySpec) -> Result<u64, StoreError> {
        self.calls.count.fetch_add(1, Ordering::Relaxed);
        trace!(query = %spec, "memory store count");
        Ok(self.evaluate(spec)?.len() as u64)
    }

    fn get(&self, kind: &str, keys: &[Value]) -> Result<Vec<Entity>, StoreError> {
        self.calls.get.fetch_add(1, Ordering::Relaxed);
        let kinds = self.kinds.read();
        let Some(rows) = kinds.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(&key.sort_key()).cloned())
            .collect())
    }

    fn delete(&self, kind: &str, keys: &[Value]) -> Result<usize, StoreError> {
        self.calls.delete.fetch_add(1, Ordering::Relaxed);
        let mut kinds = self.kinds.write();
        let Some(rows) = kinds.get_mut(kind) else {
            return Ok(0);
        };
        Ok(keys
            .iter()
            .filter(|key| rows.remove(&key.sort_key()).is_some())
            .count())
    }
}

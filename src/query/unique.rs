//! Detection of selects that pin down a single row through a uniqueness
//! constraint, and the cache keys identifying such rows.

use std::fmt;
use std::hash::Hasher;

use rustc_hash::FxHashMap;
use xxhash_rust::xxh64::Xxh64;

use crate::query::{analyze::Predicate, model::ModelMeta, value::Value};

/// Deterministic identifier of a row through one unique combination.
///
/// Rendered as `<model>|<col,col>|<xxh64 of the value sort keys>`, so the
/// same model, columns, and values always produce the same key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `values` bound to `columns` of `model`, in combination order.
    pub fn for_unique(model: &str, columns: &[String], values: &[&Value]) -> Self {
        let mut hasher = Xxh64::new(0);
        for value in values {
            let key = value.sort_key();
            hasher.write_u64(key.len() as u64);
            hasher.write(key.as_bytes());
        }
        let digest = hex::encode(hasher.finish().to_be_bytes());
        CacheKey(format!("{model}|{}|{digest}", columns.join(",")))
    }

    /// Raw key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key for the first unique combination fully bound by equality predicates.
pub fn unique_lookup_key(model: &ModelMeta, predicates: &[Predicate]) -> Option<CacheKey> {
    let bound: FxHashMap<&str, &Value> = predicates
        .iter()
        .filter_map(|predicate| match predicate {
            Predicate::Eq { column, value } if !value.is_null() => Some((column.as_str(), value)),
            _ => None,
        })
        .collect();
    if bound.is_empty() {
        return None;
    }
    model.unique_combinations().into_iter().find_map(|combo| {
        let values = combo
            .iter()
            .map(|column| bound.get(column.as_str()).copied())
            .collect::<Option<Vec<_>>>()?;
        Some(CacheKey::for_unique(model.name(), &combo, &values))
    })
}

/// Keys under which a stored row is reachable, one per fully-populated
/// unique combination. `lookup` resolves a column to the row's value.
pub fn unique_keys_for<'v, F>(model: &ModelMeta, mut lookup: F) -> Vec<CacheKey>
where
    F: FnMut(&str) -> Option<&'v Value>,
{
    model
        .unique_combinations()
        .into_iter()
        .filter_map(|combo| {
            let values = combo
                .iter()
                .map(|column| lookup(column.as_str()))
                .collect::<Option<Vec<_>>>()?;
            Some(CacheKey::for_unique(model.name(), &combo, &values))
        })
        .collect()
}

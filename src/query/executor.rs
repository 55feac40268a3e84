//! Runs compiled selects against a [`Datastore`].
//!
//! A single physical query streams straight from the store. A multi-query
//! fans out over scoped worker threads, waits for every member, then merges
//! the batches by the requested ordering, drops duplicate keys, and pages
//! the merged result. Any member failure fails the whole select.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::query::{
    ast::QueryMode,
    cache::EntityCache,
    datastore::{Datastore, Entity, EntityStream, StoreError},
    errors::{QueryError, Result},
    filters::compare_entities,
    options::QueryOptions,
    physical::QuerySpec,
    planner::CompiledQuery,
    profile::{profile_timer, record_cache_hit, record_profile_timer, QueryProfileKind},
};

/// Finite, non-restartable stream of result entities.
pub struct ResultStream {
    inner: EntityStream,
}

impl ResultStream {
    fn new(inner: EntityStream) -> Self {
        Self { inner }
    }

    fn from_entities(entities: Vec<Entity>) -> Self {
        Self::new(Box::new(entities.into_iter().map(Ok)))
    }

    fn empty() -> Self {
        Self::from_entities(Vec::new())
    }
}

impl Iterator for ResultStream {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|row| row.map_err(QueryError::from))
    }
}

/// Result of executing a select.
pub enum QueryOutput {
    /// Entities, keys, or projected rows.
    Entities(ResultStream),
    /// Match count.
    Count(u64),
}

impl QueryOutput {
    /// Count, for count-mode selects.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            QueryOutput::Count(n) => Some(*n),
            QueryOutput::Entities(_) => None,
        }
    }

    /// Drains the stream. Count outputs carry no entities.
    pub fn into_entities(self) -> Result<Vec<Entity>> {
        match self {
            QueryOutput::Entities(stream) => stream.collect(),
            QueryOutput::Count(_) => Ok(Vec::new()),
        }
    }
}

/// Executes compiled selects.
pub struct Executor {
    store: Arc<dyn Datastore>,
    cache: Arc<dyn EntityCache>,
    options: QueryOptions,
}

impl Executor {
    /// Creates an executor over `store`, consulting `cache` for unique lookups.
    pub fn new(store: Arc<dyn Datastore>, cache: Arc<dyn EntityCache>, options: QueryOptions) -> Self {
        Self {
            store,
            cache,
            options,
        }
    }

    /// Runs `compiled`, consuming it.
    pub fn execute(&self, compiled: CompiledQuery) -> Result<QueryOutput> {
        let mode = compiled.mode();
        info!(
            model = compiled.model(),
            mode = ?mode,
            subqueries = compiled.specs().len(),
            plan_hash = compiled.plan_hash(),
            "select"
        );
        if compiled.always_empty() {
            debug!(model = compiled.model(), "filter can never match; skipping store");
            return Ok(empty_output(mode));
        }
        if let Some(entity) = self.lookup_unique(&compiled) {
            return Ok(answer_from_cache(&compiled, entity));
        }

        let ordering = compiled.ordering().to_vec();
        let projection = compiled.projection().map(<[String]>::to_vec);
        let (limit, offset) = (compiled.limit(), compiled.offset());
        let mut specs = compiled.into_specs();
        if specs.len() <= 1 {
            return match specs.pop() {
                Some(spec) => self.run_single(&spec),
                None => Ok(empty_output(mode)),
            };
        }

        let batches = self.dispatch(&specs)?;
        let merge_start = profile_timer();
        let output = if mode == QueryMode::Count {
            let keys: HashSet<String> = batches
                .iter()
                .flatten()
                .map(|entity| entity.key.sort_key())
                .collect();
            QueryOutput::Count(page_len(keys.len(), offset, limit) as u64)
        } else {
            let mut rows: Vec<Entity> = batches.into_iter().flatten().collect();
            rows.sort_by(|a, b| compare_entities(a, b, &ordering));
            let mut seen = HashSet::with_capacity(rows.len());
            rows.retain(|entity| seen.insert(entity.key.sort_key()));
            let rows = rows
                .into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|entity| shape_row(entity, mode, projection.as_deref()))
                .collect();
            QueryOutput::Entities(ResultStream::from_entities(rows))
        };
        record_profile_timer(QueryProfileKind::Merge, merge_start);
        Ok(output)
    }

    fn lookup_unique(&self, compiled: &CompiledQuery) -> Option<Entity> {
        let key = compiled.cache_key()?;
        let start = profile_timer();
        let result = self.cache.get(key);
        record_profile_timer(QueryProfileKind::CacheLookup, start);
        match result {
            Ok(Some(entity)) => {
                record_cache_hit();
                debug!(key = %key, "unique lookup served from cache");
                Some(entity)
            }
            Ok(None) => {
                debug!(key = %key, "unique lookup cache miss");
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "entity cache read failed; querying store");
                None
            }
        }
    }

    fn run_single(&self, spec: &QuerySpec) -> Result<QueryOutput> {
        let start = profile_timer();
        let output = if spec.mode == QueryMode::Count {
            QueryOutput::Count(self.store.count(spec)?)
        } else {
            QueryOutput::Entities(ResultStream::new(self.store.run(spec)?))
        };
        record_profile_timer(QueryProfileKind::Dispatch, start);
        Ok(output)
    }

    /// Runs every spec on at most `max_parallelism` workers and returns the
    /// batches in spec order. The first failure stops further dispatch.
    fn dispatch(&self, specs: &[QuerySpec]) -> Result<Vec<Vec<Entity>>> {
        let workers = self.options.max_parallelism.clamp(1, specs.len().max(1));
        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<QueryError>> = Mutex::new(None);
        let slots: Vec<Mutex<Option<Vec<Entity>>>> = specs.iter().map(|_| Mutex::new(None)).collect();
        debug!(subqueries = specs.len(), workers, "dispatching multi-query");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if failed.load(Ordering::Acquire) {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::AcqRel);
                    let Some(spec) = specs.get(idx) else {
                        break;
                    };
                    trace!(index = idx, query = %spec, "running sub-query");
                    match self.collect_spec(spec) {
                        Ok(rows) => *slots[idx].lock() = Some(rows),
                        Err(err) => {
                            failed.store(true, Ordering::Release);
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            break;
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }
        Ok(slots
            .into_iter()
            .map(|slot| slot.into_inner().unwrap_or_default())
            .collect())
    }

    fn collect_spec(&self, spec: &QuerySpec) -> Result<Vec<Entity>> {
        let start = profile_timer();
        let rows = self
            .store
            .run(spec)?
            .collect::<std::result::Result<Vec<_>, StoreError>>()?;
        record_profile_timer(QueryProfileKind::Dispatch, start);
        Ok(rows)
    }
}

fn empty_output(mode: QueryMode) -> QueryOutput {
    match mode {
        QueryMode::Count => QueryOutput::Count(0),
        QueryMode::Fetch | QueryMode::KeysOnly => QueryOutput::Entities(ResultStream::empty()),
    }
}

fn answer_from_cache(compiled: &CompiledQuery, entity: Entity) -> QueryOutput {
    let (limit, offset) = (compiled.limit(), compiled.offset());
    match compiled.mode() {
        QueryMode::Count => QueryOutput::Count(page_len(1, offset, limit) as u64),
        mode => {
            let rows = std::iter::once(shape_row(entity, mode, compiled.projection()))
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .collect();
            QueryOutput::Entities(ResultStream::from_entities(rows))
        }
    }
}

/// Reduces a full row to the shape the select asked for.
fn shape_row(entity: Entity, mode: QueryMode, projection: Option<&[String]>) -> Entity {
    match (mode, projection) {
        (QueryMode::KeysOnly, _) => entity.key_only(),
        (_, Some(columns)) => entity.project(columns),
        (_, None) => entity,
    }
}

fn page_len(total: usize, offset: usize, limit: Option<usize>) -> usize {
    total.saturating_sub(offset).min(limit.unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{exact, gt, is_in, QueryBuilder};
    use crate::query::cache::{LruEntityCache, NoCache};
    use crate::query::model::{DbType, FieldDescriptor, ModelMeta};
    use crate::query::planner::Planner;
    use crate::query::special::NoSpecialIndexes;
    use crate::query::datastore::MemoryDatastore;
    use crate::query::value::Value;

    fn task() -> Arc<ModelMeta> {
        Arc::new(
            ModelMeta::new("Task", "app_task", FieldDescriptor::primary_key("id", DbType::Integer))
                .with_field(FieldDescriptor::new("status", DbType::String))
                .with_field(FieldDescriptor::new("priority", DbType::Integer)),
        )
    }

    fn seeded() -> Arc<MemoryDatastore> {
        let store = MemoryDatastore::new();
        let rows = [
            (1, "open", 5),
            (2, "blocked", 7),
            (3, "done", 9),
            (4, "open", 1),
            (5, "review", 4),
        ];
        store.put_all(rows.iter().map(|&(id, status, priority)| {
            Entity::new("app_task", id)
                .with_property("status", status)
                .with_property("priority", priority)
        }));
        Arc::new(store)
    }

    fn planner() -> Planner {
        Planner::new(Arc::new(NoSpecialIndexes), QueryOptions::default())
    }

    fn keys(output: QueryOutput) -> Vec<Value> {
        output
            .into_entities()
            .expect("entities")
            .into_iter()
            .map(|e| e.key)
            .collect()
    }

    #[test]
    fn page_len_clamps() {
        assert_eq!(page_len(5, 2, None), 3);
        assert_eq!(page_len(5, 2, Some(1)), 1);
        assert_eq!(page_len(1, 3, Some(10)), 0);
    }

    #[test]
    fn merge_orders_and_dedups() {
        let store = seeded();
        let executor = Executor::new(store.clone(), Arc::new(NoCache), QueryOptions::default());
        let out = QueryBuilder::new(task())
            .filter(is_in("status", ["open", "blocked", "open"]))
            .order_by(["-priority"])
            .execute(&planner(), &executor)
            .expect("execute");
        assert_eq!(keys(out), vec![Value::Int(2), Value::Int(1), Value::Int(4)]);
        assert_eq!(store.calls().run, 3);
    }

    #[test]
    fn keys_only_merge_keeps_requested_order() {
        let store = seeded();
        let executor = Executor::new(store, Arc::new(NoCache), QueryOptions::default());
        let out = QueryBuilder::new(task())
            .filter(is_in("status", ["open", "blocked"]))
            .order_by(["-priority"])
            .keys_only()
            .limit(2)
            .execute(&planner(), &executor)
            .expect("execute")
            .into_entities()
            .expect("rows");
        assert_eq!(out, vec![Entity::new("app_task", 2), Entity::new("app_task", 1)]);
    }

    #[test]
    fn single_worker_still_runs_every_member() {
        let store = seeded();
        let executor = Executor::new(
            store.clone(),
            Arc::new(NoCache),
            QueryOptions::default().with_max_parallelism(1),
        );
        let out = QueryBuilder::new(task())
            .exclude(exact("status", "open"))
            .execute(&planner(), &executor)
            .expect("execute");
        assert_eq!(keys(out), vec![Value::Int(2), Value::Int(3), Value::Int(5)]);
        assert_eq!(store.calls().run, 2);
    }

    #[test]
    fn single_spec_count_uses_store_count() {
        let store = seeded();
        let executor = Executor::new(store.clone(), Arc::new(NoCache), QueryOptions::default());
        let out = QueryBuilder::new(task())
            .filter(gt("priority", 4))
            .count()
            .execute(&planner(), &executor)
            .expect("execute");
        assert_eq!(out.as_count(), Some(3));
        assert_eq!(store.calls().count, 1);
        assert_eq!(store.calls().run, 0);
    }

    #[test]
    fn cache_hit_is_shaped_by_mode() {
        let store = seeded();
        let cache = Arc::new(LruEntityCache::default());
        let model = task();
        cache.cache_entity(&model, &Entity::new("app_task", 3).with_property("status", "done"));
        let executor = Executor::new(store.clone(), cache, QueryOptions::default());

        let count = QueryBuilder::new(Arc::clone(&model))
            .filter(exact("id", 3))
            .count()
            .execute(&planner(), &executor)
            .expect("execute");
        assert_eq!(count.as_count(), Some(1));

        let rows = QueryBuilder::new(Arc::clone(&model))
            .filter(exact("id", 3))
            .keys_only()
            .execute(&planner(), &executor)
            .expect("execute")
            .into_entities()
            .expect("rows");
        assert_eq!(rows, vec![Entity::new("app_task", 3)]);

        let skipped = QueryBuilder::new(model)
            .filter(exact("id", 3))
            .offset(1)
            .execute(&planner(), &executor)
            .expect("execute");
        assert!(keys(skipped).is_empty());
        assert_eq!(store.calls().queries(), 0);
    }
}

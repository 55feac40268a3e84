use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kindquery::query::builder::{exact, gt, iexact, startswith, year};
use kindquery::query::cache::{CacheError, EntityCache, LruEntityCache, NoCache};
use kindquery::query::datastore::{Entity, MemoryDatastore};
use kindquery::query::special::{InMemoryIndexRegistry, NoSpecialIndexes, SpecialOp};
use kindquery::query::unique::CacheKey;
use kindquery::query::{Executor, Planner, QueryBuilder, QueryError, Value};
use kindquery::{DbType, FieldDescriptor, ModelMeta, QueryOptions};

fn user() -> Arc<ModelMeta> {
    Arc::new(
        ModelMeta::new("User", "app_user", FieldDescriptor::primary_key("id", DbType::Integer))
            .with_field(FieldDescriptor::new("email", DbType::String).unique())
            .with_field(FieldDescriptor::new("name", DbType::String))
            .with_field(FieldDescriptor::new("joined", DbType::DateTime)),
    )
}

fn ada() -> Entity {
    Entity::new("app_user", 1)
        .with_property("email", "a@b.com")
        .with_property("name", "Ada")
        .with_property("_idx_iexact_email", "a@b.com")
        .with_property("_idx_startswith_name", "Ada")
        .with_property("_idx_year_joined", 2021_i64)
}

fn store_with_ada() -> Arc<MemoryDatastore> {
    let store = MemoryDatastore::new();
    store.put(ada());
    store.put(
        Entity::new("app_user", 2)
            .with_property("email", "c@d.com")
            .with_property("name", "Cy")
            .with_property("_idx_iexact_email", "c@d.com")
            .with_property("_idx_startswith_name", "Cy")
            .with_property("_idx_year_joined", 2019_i64),
    );
    Arc::new(store)
}

fn planner() -> Planner {
    Planner::new(Arc::new(NoSpecialIndexes), QueryOptions::default())
}

/// Cache wrapper counting reads.
struct CountingCache {
    inner: LruEntityCache,
    gets: AtomicUsize,
}

impl EntityCache for CountingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Entity>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }
}

struct BrokenCache;

impl EntityCache for BrokenCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Entity>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[test]
fn unique_hit_skips_the_store() {
    let store = store_with_ada();
    let cache = Arc::new(CountingCache {
        inner: LruEntityCache::default(),
        gets: AtomicUsize::new(0),
    });
    cache.inner.cache_entity(&user(), &ada());
    let exec = Executor::new(store.clone(), cache.clone(), QueryOptions::default());

    let rows = QueryBuilder::new(user())
        .filter(exact("email", "a@b.com"))
        .execute(&planner(), &exec)
        .expect("execute")
        .into_entities()
        .expect("rows");
    assert_eq!(rows, vec![ada()]);
    assert_eq!(store.calls().queries(), 0);
    assert_eq!(cache.gets.load(Ordering::SeqCst), 1);
}

#[test]
fn unique_miss_issues_one_store_query() {
    let store = store_with_ada();
    let cache = Arc::new(CountingCache {
        inner: LruEntityCache::default(),
        gets: AtomicUsize::new(0),
    });
    let exec = Executor::new(store.clone(), cache.clone(), QueryOptions::default());

    let rows = QueryBuilder::new(user())
        .filter(exact("email", "a@b.com"))
        .execute(&planner(), &exec)
        .expect("execute")
        .into_entities()
        .expect("rows");
    assert_eq!(rows, vec![ada()]);
    assert_eq!(store.calls().run, 1);
    assert_eq!(cache.gets.load(Ordering::SeqCst), 1);
}

#[test]
fn non_unique_equality_never_consults_cache() {
    let store = store_with_ada();
    let cache = Arc::new(CountingCache {
        inner: LruEntityCache::default(),
        gets: AtomicUsize::new(0),
    });
    let exec = Executor::new(store.clone(), cache.clone(), QueryOptions::default());

    let compiled = QueryBuilder::new(user())
        .filter(exact("name", "Ada"))
        .compile(&planner())
        .expect("plan");
    assert!(compiled.cache_key().is_none());
    let rows = exec.execute(compiled).expect("execute").into_entities().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(cache.gets.load(Ordering::SeqCst), 0);
}

#[test]
fn pk_equality_hits_cache_and_shapes_projection() {
    let store = store_with_ada();
    let cache = Arc::new(LruEntityCache::default());
    cache.cache_entity(&user(), &ada());
    let exec = Executor::new(store.clone(), cache, QueryOptions::default());

    let rows = QueryBuilder::new(user())
        .filter(exact("id", 1))
        .filter(gt("name", "A"))
        .values(["name"])
        .execute(&planner(), &exec)
        .expect("execute")
        .into_entities()
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, Value::Int(1));
    assert_eq!(rows[0].properties.keys().collect::<Vec<_>>(), vec!["name"]);
    assert_eq!(store.calls().queries(), 0);
}

#[test]
fn disabled_unique_cache_goes_to_store() {
    let store = store_with_ada();
    let cache = Arc::new(LruEntityCache::default());
    cache.cache_entity(&user(), &ada());
    let options = QueryOptions::default().with_unique_cache(false);
    let planner = Planner::new(Arc::new(NoSpecialIndexes), options.clone());
    let exec = Executor::new(store.clone(), cache, options);

    let rows = QueryBuilder::new(user())
        .filter(exact("email", "a@b.com"))
        .execute(&planner, &exec)
        .expect("execute")
        .into_entities()
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(store.calls().run, 1);
}

#[test]
fn cache_failure_falls_back_to_store() {
    let store = store_with_ada();
    let exec = Executor::new(store.clone(), Arc::new(BrokenCache), QueryOptions::default());
    let rows = QueryBuilder::new(user())
        .filter(exact("email", "a@b.com"))
        .execute(&planner(), &exec)
        .expect("execute")
        .into_entities()
        .expect("rows");
    assert_eq!(rows, vec![ada()]);
    assert_eq!(store.calls().run, 1);
}

#[test]
fn special_lookup_without_index_names_the_triple() {
    let err = QueryBuilder::new(user())
        .filter(iexact("email", "A@B.COM"))
        .compile(&planner())
        .unwrap_err();
    match &err {
        QueryError::MissingSpecialIndex {
            model,
            column,
            operator,
        } => {
            assert_eq!(model, "User");
            assert_eq!(column, "email");
            assert_eq!(*operator, "iexact");
        }
        other => panic!("unexpected error {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("[models.User]"));
    assert!(err.is_construction_error());
}

#[test]
fn declared_indexes_serve_special_lookups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("special_indexes.toml");
    std::fs::write(
        &path,
        "[models.User]\nemail = [\"iexact\"]\nname = [\"startswith\"]\njoined = [\"year\"]\n",
    )
    .expect("write");
    let registry = InMemoryIndexRegistry::load(&path).expect("load");
    let planner = Planner::new(Arc::new(registry), QueryOptions::default());
    let store = store_with_ada();
    let exec = Executor::new(store.clone(), Arc::new(NoCache), QueryOptions::default());

    let compiled = QueryBuilder::new(user())
        .filter(iexact("email", "A@B.COM"))
        .compile(&planner)
        .expect("plan");
    assert_eq!(
        compiled.specs()[0].filters[0].to_string(),
        "_idx_iexact_email = str:a@b.com"
    );

    for builder in [
        QueryBuilder::new(user()).filter(iexact("email", "A@B.COM")),
        QueryBuilder::new(user()).filter(startswith("name", "Ada")),
        QueryBuilder::new(user()).filter(year("joined", 2021)),
    ] {
        let rows = builder
            .execute(&planner, &exec)
            .expect("execute")
            .into_entities()
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, Value::Int(1));
    }
}

#[test]
fn registry_built_in_code_matches_loaded_one() {
    let registry = InMemoryIndexRegistry::new().with_index("User", "email", SpecialOp::IExact);
    let planner = Planner::new(Arc::new(registry), QueryOptions::default());
    let err = QueryBuilder::new(user())
        .filter(startswith("email", "a"))
        .compile(&planner)
        .unwrap_err();
    assert_eq!(err.code(), "MissingSpecialIndex");
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of query pipeline profiling metrics.
///
/// Profiling is enabled via the `KINDQUERY_PROFILE` environment variable and
/// tracks time spent compiling selects, probing the unique-lookup cache,
/// dispatching physical queries, and merging multi-query results.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent compiling selects.
    pub compile_ns: u64,
    /// Number of compiled selects.
    pub compile_count: u64,
    /// Total nanoseconds spent in cache lookups.
    pub cache_lookup_ns: u64,
    /// Number of cache lookups.
    pub cache_lookup_count: u64,
    /// Cache lookups that returned an entity.
    pub cache_hits: u64,
    /// Total nanoseconds spent waiting on store calls.
    pub dispatch_ns: u64,
    /// Number of store calls.
    pub dispatch_count: u64,
    /// Total nanoseconds spent merging multi-query results.
    pub merge_ns: u64,
    /// Number of merges.
    pub merge_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    compile_ns: AtomicU64,
    compile_count: AtomicU64,
    cache_lookup_ns: AtomicU64,
    cache_lookup_count: AtomicU64,
    cache_hits: AtomicU64,
    dispatch_ns: AtomicU64,
    dispatch_count: AtomicU64,
    merge_ns: AtomicU64,
    merge_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("KINDQUERY_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    Compile,
    CacheLookup,
    Dispatch,
    Merge,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Compile => (&counters.compile_ns, &counters.compile_count),
        QueryProfileKind::CacheLookup => (&counters.cache_lookup_ns, &counters.cache_lookup_count),
        QueryProfileKind::Dispatch => (&counters.dispatch_ns, &counters.dispatch_count),
        QueryProfileKind::Merge => (&counters.merge_ns, &counters.merge_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_hit() {
    if let Some(counters) = counters() {
        counters.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retrieves a snapshot of current query profiling metrics.
///
/// Returns `None` unless `KINDQUERY_PROFILE` was set when the process first
/// touched the profiler. With `reset`, counters are zeroed as they are read.
///
/// ```no_run
/// use kindquery::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(true) {
///     println!("cache hits: {}", snapshot.cache_hits);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        compile_ns: load(&counters.compile_ns),
        compile_count: load(&counters.compile_count),
        cache_lookup_ns: load(&counters.cache_lookup_ns),
        cache_lookup_count: load(&counters.cache_lookup_count),
        cache_hits: load(&counters.cache_hits),
        dispatch_ns: load(&counters.dispatch_ns),
        dispatch_count: load(&counters.dispatch_count),
        merge_ns: load(&counters.merge_ns),
        merge_count: load(&counters.merge_count),
    })
}

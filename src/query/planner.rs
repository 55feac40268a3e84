//! Lowers a normalized select into store-native physical queries.
//!
//! The planner runs the pure compile pipeline:
//!
//! 1. [`normalize`] the filter tree into flat predicates;
//! 2. resolve special operators against the [`SpecialIndexRegistry`];
//! 3. pick a legal projection;
//! 4. lower native predicates onto one base [`QuerySpec`] and expand every
//!    `IN` and `!=` into the Cartesian product of alternatives;
//! 5. detect unique lookups answerable from the entity cache.
//!
//! The result is an immutable [`CompiledQuery`] carrying the physical set,
//! an explain tree, and a deterministic plan hash.

use std::hash::Hasher;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::query::{
    analyze::{normalize, NormalizedQuery, Predicate},
    ast::{OrderBy, QueryMode, SelectQuery},
    errors::{QueryError, Result},
    model::ModelMeta,
    options::QueryOptions,
    physical::{Direction, Filter, FilterOp, Order, QuerySpec, CLASS_PROPERTY, KEY_PROPERTY},
    profile::{profile_timer, record_profile_timer, QueryProfileKind},
    projection::projection_for,
    special::SpecialIndexRegistry,
    unique::{unique_lookup_key, CacheKey},
    value::Value,
};

/// Compiles selects into physical query sets.
#[derive(Clone)]
pub struct Planner {
    registry: Arc<dyn SpecialIndexRegistry>,
    options: QueryOptions,
}

impl Planner {
    /// Creates a planner resolving special operators through `registry`.
    pub fn new(registry: Arc<dyn SpecialIndexRegistry>, options: QueryOptions) -> Self {
        Self { registry, options }
    }

    /// Options in effect.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Compiles `query`. Fails before touching the store on any
    /// construction or configuration error.
    pub fn plan(&self, query: &SelectQuery) -> Result<CompiledQuery> {
        let start = profile_timer();
        let model = query.model.as_ref();
        let normalized = normalize(model, query.filter.as_ref())?;

        let pk_only = !query.columns.is_empty() && query.columns.iter().all(|c| model.is_pk(c));
        let mode = match query.mode {
            QueryMode::Fetch if pk_only => QueryMode::KeysOnly,
            other => other,
        };
        let projection = projection_for(model, &query.columns, mode, &normalized)?;
        let ordering = lower_ordering(model, &query.ordering)?;

        let mut base = QuerySpec::new(model.root_table());
        base.projection = projection.clone();
        base.keys_only = mode == QueryMode::KeysOnly;
        base.ordering = ordering.clone();
        base.mode = mode;
        if model.has_concrete_parents() && !model.is_proxy() {
            base.filters
                .push(Filter::new(CLASS_PROPERTY, FilterOp::Eq, Value::from(model.table())));
        }

        let mut expansions: Vec<Vec<Filter>> = Vec::new();
        for predicate in &normalized.predicates {
            let property = store_property(model, predicate.column());
            match predicate {
                Predicate::Eq { value, .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Eq, value.clone()));
                }
                Predicate::Gt { value, .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Gt, value.clone()));
                }
                Predicate::Ge { value, .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Ge, value.clone()));
                }
                Predicate::Lt { value, .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Lt, value.clone()));
                }
                Predicate::Le { value, .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Le, value.clone()));
                }
                Predicate::IsNull { .. } => {
                    base.filters.push(Filter::new(property, FilterOp::Eq, Value::Null));
                }
                Predicate::Special { column, op, value } => {
                    let index = self.registry.resolve(model.name(), column, *op).ok_or_else(|| {
                        QueryError::MissingSpecialIndex {
                            model: model.name().to_owned(),
                            column: column.clone(),
                            operator: op.name(),
                        }
                    })?;
                    let value = index.transform.apply(value).ok_or_else(|| QueryError::InvalidOperand {
                        column: column.clone(),
                        operator: op.name(),
                    })?;
                    base.filters
                        .push(Filter::new(index.indexed_column, FilterOp::Eq, value));
                }
                Predicate::In { values, .. } => {
                    expansions.push(
                        values
                            .iter()
                            .map(|value| Filter::new(property.clone(), FilterOp::Eq, value.clone()))
                            .collect(),
                    );
                }
                Predicate::OpenRange { value, .. } => {
                    expansions.push(vec![
                        Filter::new(property.clone(), FilterOp::Lt, value.clone()),
                        Filter::new(property, FilterOp::Gt, value.clone()),
                    ]);
                }
            }
        }

        let expanded = !expansions.is_empty();
        let specs = if normalized.always_empty {
            Vec::new()
        } else {
            let count = expansions
                .iter()
                .try_fold(1usize, |acc, alts| acc.checked_mul(alts.len()))
                .unwrap_or(usize::MAX);
            if count > self.options.max_subqueries {
                return Err(QueryError::TooManySubqueries {
                    count,
                    max: self.options.max_subqueries,
                });
            }
            page_specs(expand(base, &expansions), mode, query.limit, query.offset, expanded)
        };

        let cache_key = if self.options.use_unique_cache && specs.len() == 1 && !expanded {
            unique_lookup_key(model, &normalized.predicates)
        } else {
            None
        };

        let mut compiled = CompiledQuery {
            model: model.name().to_owned(),
            specs,
            expanded,
            normalized,
            ordering,
            projection,
            mode,
            limit: query.limit,
            offset: query.offset,
            cache_key,
            plan_hash: 0,
        };
        compiled.plan_hash = compute_plan_hash(&compiled);
        debug!(
            model = %compiled.model,
            specs = compiled.specs.len(),
            expanded = compiled.expanded,
            always_empty = compiled.always_empty(),
            unique_lookup = compiled.cache_key.is_some(),
            plan_hash = compiled.plan_hash,
            "compiled select"
        );
        record_profile_timer(QueryProfileKind::Compile, start);
        Ok(compiled)
    }
}

/// Immutable output of [`Planner::plan`], consumed by the executor.
#[derive(Debug)]
pub struct CompiledQuery {
    model: String,
    specs: Vec<QuerySpec>,
    expanded: bool,
    normalized: NormalizedQuery,
    ordering: Vec<Order>,
    projection: Option<Vec<String>>,
    mode: QueryMode,
    limit: Option<usize>,
    offset: usize,
    cache_key: Option<CacheKey>,
    plan_hash: u64,
}

impl CompiledQuery {
    /// Queried model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Physical queries to run. Empty when the select can never match.
    pub fn specs(&self) -> &[QuerySpec] {
        &self.specs
    }

    /// True when `IN` or `!=` multiplied the physical set.
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Normalized predicates.
    pub fn predicates(&self) -> &[Predicate] {
        &self.normalized.predicates
    }

    /// Keys named by primary-key equality or membership.
    pub fn included_keys(&self) -> &[Value] {
        &self.normalized.included_keys
    }

    /// Keys named by negated primary-key equality.
    pub fn excluded_keys(&self) -> &[Value] {
        &self.normalized.excluded_keys
    }

    /// True when the select can never match.
    pub fn always_empty(&self) -> bool {
        self.normalized.always_empty
    }

    /// True when an inequality was lowered.
    pub fn has_inequality(&self) -> bool {
        self.normalized.has_inequality
    }

    /// Merge ordering.
    pub fn ordering(&self) -> &[Order] {
        &self.ordering
    }

    /// Projected columns, if any.
    pub fn projection(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    /// Effective result shape.
    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Requested limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Requested offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Unique-lookup cache key when the select pins a single row.
    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    /// Deterministic hash of the compiled plan.
    pub fn plan_hash(&self) -> u64 {
        self.plan_hash
    }

    pub(crate) fn into_specs(self) -> Vec<QuerySpec> {
        self.specs
    }

    /// Explain tree for diagnostics.
    pub fn explain(&self) -> PlanExplain {
        let query_nodes = || self.specs.iter().map(explain_spec).collect::<Vec<_>>();
        let root = if self.always_empty() {
            let mut node = ExplainNode::new("Empty");
            node.props.push(ExplainProp::plain("reason", "filter can never match"));
            node
        } else if self.specs.len() > 1 {
            let mut node = ExplainNode::new("MultiQuery");
            node.props.push(ExplainProp::plain("subqueries", self.specs.len().to_string()));
            node.props.push(ExplainProp::plain("merge_order", join_orders(&self.ordering)));
            node.props.push(ExplainProp::plain("dedup", "key"));
            push_paging(&mut node, self.limit, self.offset);
            node.inputs = query_nodes();
            node
        } else {
            let mut inputs = query_nodes();
            match (&self.cache_key, inputs.pop()) {
                (Some(key), Some(query)) => {
                    let mut node = ExplainNode::new("UniqueLookup");
                    node.props.push(ExplainProp::literal("cache_key", key.as_str()));
                    node.inputs.push(query);
                    node
                }
                (_, Some(query)) => query,
                (_, None) => ExplainNode::new("Empty"),
            }
        };
        PlanExplain {
            root,
            plan_hash: self.plan_hash,
        }
    }
}

/// Explain payload returned to callers.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node.
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

impl PlanExplain {
    /// Renders the tree as JSON, optionally masking literal values.
    pub fn to_json(&self, redact_literals: bool) -> serde_json::Result<String> {
        if !redact_literals {
            return serde_json::to_string_pretty(self);
        }
        let mut redacted = self.clone();
        redacted.root.redact();
        serde_json::to_string_pretty(&redacted)
    }
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    pub props: Vec<ExplainProp>,
    /// Input operators
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn redact(&mut self) {
        for prop in &mut self.props {
            if prop.redactable {
                prop.value = "<redacted>".into();
            }
        }
        for input in &mut self.inputs {
            input.redact();
        }
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    #[serde(skip)]
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

fn store_property(model: &ModelMeta, column: &str) -> String {
    if model.is_pk(column) {
        KEY_PROPERTY.to_owned()
    } else {
        column.to_owned()
    }
}

fn lower_ordering(model: &ModelMeta, requested: &[OrderBy]) -> Result<Vec<Order>> {
    let defaults;
    let entries = if requested.is_empty() {
        defaults = model
            .default_ordering()
            .iter()
            .map(|spec| OrderBy::parse(spec))
            .collect::<Vec<_>>();
        &defaults
    } else {
        requested
    };
    entries
        .iter()
        .map(|entry| {
            if model.field(&entry.column).is_none() {
                return Err(QueryError::unknown_column(model.name(), &entry.column));
            }
            Ok(Order {
                property: store_property(model, &entry.column),
                direction: if entry.descending {
                    Direction::Descending
                } else {
                    Direction::Ascending
                },
            })
        })
        .collect()
}

fn expand(base: QuerySpec, expansions: &[Vec<Filter>]) -> Vec<QuerySpec> {
    expansions.iter().fold(vec![base], |specs, alternatives| {
        let mut next = Vec::with_capacity(specs.len() * alternatives.len());
        for spec in &specs {
            next.extend(alternatives.iter().map(|filter| spec.with_filter(filter.clone())));
        }
        next
    })
}

/// Pushes paging into the physical set. A single query pages natively;
/// members of a multi-query fetch enough rows to page after the merge, and
/// a multi-query count gathers keys so duplicates can be dropped. Members
/// whose rows would lack an ordering property run as full fetches so the
/// merge can order them; the executor reshapes the merged rows.
fn page_specs(
    mut specs: Vec<QuerySpec>,
    mode: QueryMode,
    limit: Option<usize>,
    offset: usize,
    expanded: bool,
) -> Vec<QuerySpec> {
    for spec in &mut specs {
        if expanded {
            spec.limit = limit.map(|limit| limit.saturating_add(offset));
            spec.offset = 0;
            if mode == QueryMode::Count {
                spec.mode = QueryMode::KeysOnly;
                spec.keys_only = true;
            } else if !carries_ordering(spec) {
                spec.mode = QueryMode::Fetch;
                spec.keys_only = false;
                spec.projection = None;
            }
        } else {
            spec.limit = limit;
            spec.offset = offset;
        }
    }
    specs
}

/// True when every row `spec` returns holds the values it is ordered by.
fn carries_ordering(spec: &QuerySpec) -> bool {
    spec.ordering.iter().all(|order| {
        order.property == KEY_PROPERTY
            || (!spec.keys_only
                && spec
                    .projection
                    .as_ref()
                    .map_or(true, |columns| columns.contains(&order.property)))
    })
}

fn explain_spec(spec: &QuerySpec) -> ExplainNode {
    let mut node = ExplainNode::new(match spec.mode {
        QueryMode::Count => "Count",
        QueryMode::KeysOnly => "KeysOnlyQuery",
        QueryMode::Fetch if spec.projection.is_some() => "ProjectionQuery",
        QueryMode::Fetch => "Query",
    });
    node.props.push(ExplainProp::plain("kind", spec.kind.clone()));
    for filter in &spec.filters {
        node.props.push(ExplainProp::literal(
            format!("{} {}", filter.property, filter.op.symbol()),
            filter.value.sort_key(),
        ));
    }
    if !spec.ordering.is_empty() {
        node.props.push(ExplainProp::plain("order", join_orders(&spec.ordering)));
    }
    if let Some(projection) = &spec.projection {
        node.props.push(ExplainProp::plain("projection", projection.join(", ")));
    }
    push_paging(&mut node, spec.limit, spec.offset);
    node
}

fn push_paging(node: &mut ExplainNode, limit: Option<usize>, offset: usize) {
    if let Some(limit) = limit {
        node.props.push(ExplainProp::plain("limit", limit.to_string()));
    }
    if offset > 0 {
        node.props.push(ExplainProp::plain("offset", offset.to_string()));
    }
}

fn join_orders(ordering: &[Order]) -> String {
    ordering
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn compute_plan_hash(compiled: &CompiledQuery) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write(compiled.model.as_bytes());
    hasher.write_u8(match compiled.mode {
        QueryMode::Fetch => 0,
        QueryMode::Count => 1,
        QueryMode::KeysOnly => 2,
    });
    hasher.write_u8(compiled.always_empty() as u8);
    hasher.write_u64(compiled.limit.map_or(u64::MAX, |l| l as u64));
    hasher.write_u64(compiled.offset as u64);
    hasher.write_u64(compiled.specs.len() as u64);
    for spec in &compiled.specs {
        hash_spec(spec, &mut hasher);
    }
    hasher.finish()
}

fn hash_spec(spec: &QuerySpec, hasher: &mut Xxh64) {
    hasher.write(spec.kind.as_bytes());
    hasher.write_u8(spec.keys_only as u8);
    hasher.write_u64(spec.filters.len() as u64);
    for filter in &spec.filters {
        hasher.write(filter.property.as_bytes());
        hasher.write(filter.op.symbol().as_bytes());
        hasher.write(filter.value.sort_key().as_bytes());
    }
    for order in &spec.ordering {
        hasher.write(order.to_string().as_bytes());
    }
    if let Some(projection) = &spec.projection {
        for column in projection {
            hasher.write(column.as_bytes());
        }
    }
}

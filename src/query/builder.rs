//! Fluent construction of selects and filter trees.

use std::sync::Arc;

use crate::query::{
    ast::{FilterNode, LookupOp, Operand, OrderBy, QueryMode, SelectQuery},
    errors::Result,
    executor::{Executor, QueryOutput},
    model::ModelMeta,
    planner::{CompiledQuery, Planner},
    value::Value,
};

/// `column = value`.
pub fn exact(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Exact, Operand::One(value.into()))
}

/// `column > value`.
pub fn gt(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Gt, Operand::One(value.into()))
}

/// `column >= value`.
pub fn gte(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Gte, Operand::One(value.into()))
}

/// `column < value`.
pub fn lt(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Lt, Operand::One(value.into()))
}

/// `column <= value`.
pub fn lte(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Lte, Operand::One(value.into()))
}

/// `column IS NULL` when `is_null`, otherwise `column IS NOT NULL`.
pub fn is_null(column: &str, is_null: bool) -> FilterNode {
    FilterNode::leaf(column, LookupOp::IsNull, Operand::One(Value::Bool(is_null)))
}

/// `column IN (values)`.
pub fn is_in<I, V>(column: &str, values: I) -> FilterNode
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    FilterNode::leaf(
        column,
        LookupOp::In,
        Operand::Many(values.into_iter().map(Into::into).collect()),
    )
}

/// Case-insensitive equality.
pub fn iexact(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::IExact, Operand::One(value.into()))
}

/// Prefix match.
pub fn startswith(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::StartsWith, Operand::One(value.into()))
}

/// Calendar-year match.
pub fn year(column: &str, value: impl Into<Value>) -> FilterNode {
    FilterNode::leaf(column, LookupOp::Year, Operand::One(value.into()))
}

/// Builder accumulating filters the way ORM querysets chain them.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    query: SelectQuery,
    conditions: Vec<FilterNode>,
}

impl QueryBuilder {
    /// Starts an unfiltered fetch over `model`.
    pub fn new(model: Arc<ModelMeta>) -> Self {
        Self {
            query: SelectQuery::new(model),
            conditions: Vec::new(),
        }
    }

    /// ANDs `node` into the filter.
    pub fn filter(mut self, node: FilterNode) -> Self {
        self.conditions.push(node);
        self
    }

    /// ANDs the negation of `node` into the filter.
    pub fn exclude(mut self, node: FilterNode) -> Self {
        self.conditions.push(FilterNode::not(node));
        self
    }

    /// Replaces the ordering; `-col` sorts descending.
    pub fn order_by<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query.ordering = specs
            .into_iter()
            .map(|spec| OrderBy::parse(spec.as_ref()))
            .collect();
        self
    }

    /// Restricts the returned columns.
    pub fn values<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Caps the number of returned rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Skips leading rows.
    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = offset;
        self
    }

    /// Switches to count mode.
    pub fn count(mut self) -> Self {
        self.query.mode = QueryMode::Count;
        self
    }

    /// Switches to keys-only mode.
    pub fn keys_only(mut self) -> Self {
        self.query.mode = QueryMode::KeysOnly;
        self
    }

    /// Finalizes the select.
    pub fn build(self) -> SelectQuery {
        let QueryBuilder {
            mut query,
            mut conditions,
        } = self;
        query.filter = match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(FilterNode::and(conditions)),
        };
        query
    }

    /// Builds and compiles the select.
    pub fn compile(self, planner: &Planner) -> Result<CompiledQuery> {
        planner.plan(&self.build())
    }

    /// Builds, compiles, and executes the select.
    pub fn execute(self, planner: &Planner, executor: &Executor) -> Result<QueryOutput> {
        executor.execute(self.compile(planner)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Connector;
    use crate::query::model::{DbType, FieldDescriptor};

    fn model() -> Arc<ModelMeta> {
        Arc::new(ModelMeta::new(
            "Task",
            "app_task",
            FieldDescriptor::primary_key("id", DbType::Integer),
        ))
    }

    #[test]
    fn single_condition_is_not_wrapped() {
        let query = QueryBuilder::new(model()).filter(exact("id", 1)).build();
        assert_eq!(query.filter, Some(exact("id", 1)));
    }

    #[test]
    fn chained_conditions_become_an_and_group() {
        let query = QueryBuilder::new(model())
            .filter(exact("a", 1))
            .exclude(exact("b", 2))
            .order_by(["-a"])
            .limit(5)
            .offset(2)
            .build();
        match query.filter {
            Some(FilterNode::Group {
                connector: Connector::And,
                negated: false,
                children,
            }) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], FilterNode::Group { negated: true, .. }));
            }
            other => panic!("unexpected filter {other:?}"),
        }
        assert!(query.ordering[0].descending);
        assert_eq!((query.limit, query.offset), (Some(5), 2));
    }

    #[test]
    fn is_in_collects_values() {
        match is_in("status", ["open", "blocked"]) {
            FilterNode::Leaf(lookup) => assert_eq!(
                lookup.operand,
                Operand::Many(vec![Value::from("open"), Value::from("blocked")])
            ),
            other => panic!("unexpected node {other:?}"),
        }
    }
}

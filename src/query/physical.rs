//! Store-native query units produced by the planner.

use std::fmt;

use crate::query::ast::QueryMode;
use crate::query::value::Value;

/// Property the store uses for entity keys.
pub const KEY_PROPERTY: &str = "__key__";

/// Discriminator property written on rows of models stored in an ancestor's table.
pub const CLASS_PROPERTY: &str = "class";

/// Comparison supported natively by the store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FilterOp {
    /// Equality.
    Eq,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Le,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Ge,
}

impl FilterOp {
    /// Operator symbol as the store spells it.
    pub fn symbol(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }

    /// True for every operator but equality.
    pub fn is_inequality(self) -> bool {
        self != FilterOp::Eq
    }
}

/// Single store filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    /// Property name; the key is [`KEY_PROPERTY`].
    pub property: String,
    /// Comparison.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

impl Filter {
    /// Builds a filter.
    pub fn new(property: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            property: property.into(),
            op,
            value,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.property, self.op.symbol(), self.value.sort_key())
    }
}

/// Sort direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Sort order entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Order {
    /// Property to sort on.
    pub property: String,
    /// Direction.
    pub direction: Direction,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => f.write_str(&self.property),
            Direction::Descending => write!(f, "-{}", self.property),
        }
    }
}

/// One physical query the store can run as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    /// Kind (table) queried.
    pub kind: String,
    /// Projected properties; `None` fetches whole entities.
    pub projection: Option<Vec<String>>,
    /// Return keys only.
    pub keys_only: bool,
    /// Conjunctive filters.
    pub filters: Vec<Filter>,
    /// Sort orders.
    pub ordering: Vec<Order>,
    /// Maximum rows.
    pub limit: Option<usize>,
    /// Rows skipped.
    pub offset: usize,
    /// Result shape.
    pub mode: QueryMode,
}

impl QuerySpec {
    /// Unfiltered fetch over `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            projection: None,
            keys_only: false,
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: 0,
            mode: QueryMode::Fetch,
        }
    }

    /// Copy of `self` with one more filter.
    pub fn with_filter(&self, filter: Filter) -> Self {
        let mut spec = self.clone();
        spec.filters.push(filter);
        spec
    }

    /// Distinct properties carrying an inequality filter.
    pub fn inequality_properties(&self) -> Vec<&str> {
        let mut props: Vec<&str> = self
            .filters
            .iter()
            .filter(|f| f.op.is_inequality())
            .map(|f| f.property.as_str())
            .collect();
        props.sort_unstable();
        props.dedup();
        props
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.filters.is_empty() {
            let filters: Vec<String> = self.filters.iter().map(ToString::to_string).collect();
            write!(f, " WHERE {}", filters.join(" AND "))?;
        }
        if !self.ordering.is_empty() {
            let orders: Vec<String> = self.ordering.iter().map(ToString::to_string).collect();
            write!(f, " ORDER BY {}", orders.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inequality_properties_are_distinct() {
        let spec = QuerySpec::new("app_task")
            .with_filter(Filter::new("priority", FilterOp::Gt, Value::Int(1)))
            .with_filter(Filter::new("priority", FilterOp::Lt, Value::Int(9)))
            .with_filter(Filter::new("status", FilterOp::Eq, "open".into()));
        assert_eq!(spec.inequality_properties(), vec!["priority"]);
    }

    #[test]
    fn display_reads_like_gql() {
        let mut spec = QuerySpec::new("app_task")
            .with_filter(Filter::new("status", FilterOp::Eq, "open".into()));
        spec.ordering.push(Order {
            property: "priority".into(),
            direction: Direction::Descending,
        });
        assert_eq!(
            spec.to_string(),
            "app_task WHERE status = str:open ORDER BY -priority"
        );
    }
}

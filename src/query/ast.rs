//! Input representation of a relational-style select.
//!
//! The structures here mirror what an ORM adapter hands over: a tree of
//! AND/OR groups whose leaves are `column__operator = operand` lookups,
//! plus ordering, requested columns, and paging. Nothing in this module
//! knows about the store; lowering happens in the analyzer and planner.

use std::fmt;
use std::sync::Arc;

use crate::query::model::ModelMeta;
use crate::query::value::Value;

/// Boolean connector for a filter group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Connector {
    /// All children must hold.
    And,
    /// Any child may hold.
    Or,
}

/// Lookup operators accepted on leaves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LookupOp {
    /// `column = value`.
    Exact,
    /// `column > value`.
    Gt,
    /// `column >= value`.
    Gte,
    /// `column < value`.
    Lt,
    /// `column <= value`.
    Lte,
    /// `column IS [NOT] NULL`; operand is a boolean.
    IsNull,
    /// `column IN (values)`.
    In,
    /// Case-insensitive equality, served by an auxiliary index.
    IExact,
    /// Prefix match, served by an auxiliary index.
    StartsWith,
    /// Calendar-year match on a datetime, served by an auxiliary index.
    Year,
}

impl LookupOp {
    /// Lookup name as written after `__` by ORM adapters.
    pub fn name(self) -> &'static str {
        match self {
            LookupOp::Exact => "exact",
            LookupOp::Gt => "gt",
            LookupOp::Gte => "gte",
            LookupOp::Lt => "lt",
            LookupOp::Lte => "lte",
            LookupOp::IsNull => "isnull",
            LookupOp::In => "in",
            LookupOp::IExact => "iexact",
            LookupOp::StartsWith => "startswith",
            LookupOp::Year => "year",
        }
    }

    /// Parses a lookup name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => LookupOp::Exact,
            "gt" => LookupOp::Gt,
            "gte" => LookupOp::Gte,
            "lt" => LookupOp::Lt,
            "lte" => LookupOp::Lte,
            "isnull" => LookupOp::IsNull,
            "in" => LookupOp::In,
            "iexact" => LookupOp::IExact,
            "startswith" => LookupOp::StartsWith,
            "year" => LookupOp::Year,
            _ => return None,
        })
    }
}

impl fmt::Display for LookupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Right-hand side of a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Single value.
    One(Value),
    /// Membership list for `In`.
    Many(Vec<Value>),
}

macro_rules! operand_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::One(value.into())
                }
            }
        )*
    };
}

operand_from_scalar!(Value, bool, i32, i64, f64, &str, String);

impl From<Vec<Value>> for Operand {
    fn from(values: Vec<Value>) -> Self {
        Operand::Many(values)
    }
}

/// Leaf predicate `column__op = operand`.
#[derive(Clone, Debug, PartialEq)]
pub struct Lookup {
    /// Target column on the queried model.
    pub column: String,
    /// Lookup operator.
    pub op: LookupOp,
    /// Operand.
    pub operand: Operand,
}

/// Node in a filter tree.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    /// Leaf lookup.
    Leaf(Lookup),
    /// Connector over children, optionally negated.
    Group {
        /// Connector joining the children.
        connector: Connector,
        /// Inverts the whole group.
        negated: bool,
        /// Child nodes.
        children: Vec<FilterNode>,
    },
}

impl FilterNode {
    /// Builds a leaf.
    pub fn leaf(column: impl Into<String>, op: LookupOp, operand: impl Into<Operand>) -> Self {
        FilterNode::Leaf(Lookup {
            column: column.into(),
            op,
            operand: operand.into(),
        })
    }

    /// AND group.
    pub fn and(children: impl IntoIterator<Item = FilterNode>) -> Self {
        FilterNode::Group {
            connector: Connector::And,
            negated: false,
            children: children.into_iter().collect(),
        }
    }

    /// OR group.
    pub fn or(children: impl IntoIterator<Item = FilterNode>) -> Self {
        FilterNode::Group {
            connector: Connector::Or,
            negated: false,
            children: children.into_iter().collect(),
        }
    }

    /// Negates a node, wrapping leaves in a single-child AND group.
    pub fn not(node: FilterNode) -> Self {
        match node {
            FilterNode::Group {
                connector,
                negated,
                children,
            } => FilterNode::Group {
                connector,
                negated: !negated,
                children,
            },
            leaf @ FilterNode::Leaf(_) => FilterNode::Group {
                connector: Connector::And,
                negated: true,
                children: vec![leaf],
            },
        }
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            FilterNode::Leaf(_) => 1,
            FilterNode::Group { children, .. } => children.iter().map(Self::leaf_count).sum(),
        }
    }
}

/// Requested ordering entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrderBy {
    /// Column to sort on.
    pub column: String,
    /// Sort direction.
    pub descending: bool,
}

impl OrderBy {
    /// Parses `col` or `-col`.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(column) => OrderBy {
                column: column.to_owned(),
                descending: true,
            },
            None => OrderBy {
                column: spec.to_owned(),
                descending: false,
            },
        }
    }
}

/// What the caller wants back.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum QueryMode {
    /// Entities (full or projected).
    #[default]
    Fetch,
    /// Number of matching entities.
    Count,
    /// Keys only.
    KeysOnly,
}

/// Logical select handed to the planner.
#[derive(Clone, Debug)]
pub struct SelectQuery {
    /// Queried model.
    pub model: Arc<ModelMeta>,
    /// Filter tree; `None` matches everything.
    pub filter: Option<FilterNode>,
    /// Requested ordering; empty falls back to the model default.
    pub ordering: Vec<OrderBy>,
    /// Requested output columns; empty means every column.
    pub columns: Vec<String>,
    /// Result shape.
    pub mode: QueryMode,
    /// Maximum rows returned.
    pub limit: Option<usize>,
    /// Rows skipped before the first returned row.
    pub offset: usize,
}

impl SelectQuery {
    /// Unfiltered fetch of every column.
    pub fn new(model: Arc<ModelMeta>) -> Self {
        Self {
            model,
            filter: None,
            ordering: Vec::new(),
            columns: Vec::new(),
            mode: QueryMode::Fetch,
            limit: None,
            offset: 0,
        }
    }
}

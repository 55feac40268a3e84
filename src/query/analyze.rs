//! Filter-tree normalization.
//!
//! [`normalize`] walks a [`FilterNode`] tree with an explicit negation flag
//! and produces a flat list of [`Predicate`]s the planner can lower into
//! store filters. Along the way it:
//!
//! * rejects OR groups that are not under negation;
//! * rewrites negated equality into an [`Predicate::OpenRange`] (`< v` or `> v`);
//! * rejects every other negated operator;
//! * records primary-key fast paths (`included_keys`, `excluded_keys`) and
//!   detects filters that can never match (`always_empty`);
//! * enforces the store's single-inequality-property rule.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use crate::query::{
    ast::{Connector, FilterNode, Lookup, LookupOp, Operand},
    errors::{QueryError, Result},
    model::{FieldDescriptor, ModelMeta},
    special::SpecialOp,
    value::Value,
};

/// Normalized predicate over a single column.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Predicate {
    /// `column = value`.
    Eq { column: String, value: Value },
    /// `column > value`.
    Gt { column: String, value: Value },
    /// `column >= value`.
    Ge { column: String, value: Value },
    /// `column < value`.
    Lt { column: String, value: Value },
    /// `column <= value`.
    Le { column: String, value: Value },
    /// `column IS NULL`.
    IsNull { column: String },
    /// `column IN (values)`; expands into one query per value.
    In { column: String, values: Vec<Value> },
    /// `column != value`; expands into `< value` and `> value`.
    OpenRange { column: String, value: Value },
    /// Special operator awaiting index resolution.
    Special {
        column: String,
        op: SpecialOp,
        value: Value,
    },
}

impl Predicate {
    /// Target column.
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. }
            | Predicate::Gt { column, .. }
            | Predicate::Ge { column, .. }
            | Predicate::Lt { column, .. }
            | Predicate::Le { column, .. }
            | Predicate::IsNull { column }
            | Predicate::In { column, .. }
            | Predicate::OpenRange { column, .. }
            | Predicate::Special { column, .. } => column,
        }
    }

    /// True for `Gt/Ge/Lt/Le`.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Predicate::Gt { .. } | Predicate::Ge { .. } | Predicate::Lt { .. } | Predicate::Le { .. }
        )
    }

    /// True for predicates that multiply the physical query set.
    pub fn needs_expansion(&self) -> bool {
        matches!(self, Predicate::In { .. } | Predicate::OpenRange { .. })
    }

    /// Operator label for diagnostics.
    pub fn operator_name(&self) -> &'static str {
        match self {
            Predicate::Eq { .. } => "eq",
            Predicate::Gt { .. } => "gt",
            Predicate::Ge { .. } => "ge",
            Predicate::Lt { .. } => "lt",
            Predicate::Le { .. } => "le",
            Predicate::IsNull { .. } => "isnull",
            Predicate::In { .. } => "in",
            Predicate::OpenRange { .. } => "neq",
            Predicate::Special { op, .. } => op.name(),
        }
    }
}

/// Immutable result of normalization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedQuery {
    /// Predicates in tree order.
    pub predicates: Vec<Predicate>,
    /// Keys named by primary-key equality or membership.
    pub included_keys: Vec<Value>,
    /// Keys named by negated primary-key equality.
    pub excluded_keys: Vec<Value>,
    /// The filter can never match.
    pub always_empty: bool,
    /// At least one range or open-range predicate is present.
    pub has_inequality: bool,
    /// Columns targeted by `exact`, `in`, or `isnull` leaves, negated or not.
    pub equality_columns: BTreeSet<String>,
}

/// Normalizes `filter` against `model`.
pub fn normalize(model: &ModelMeta, filter: Option<&FilterNode>) -> Result<NormalizedQuery> {
    let mut ctx = NormalizeContext::new(model);
    if let Some(node) = filter {
        ctx.walk(node, false)?;
    }
    Ok(ctx.finish())
}

/// Append-only state threaded through one normalization pass.
struct NormalizeContext<'m> {
    model: &'m ModelMeta,
    out: NormalizedQuery,
    range_column: Option<String>,
    open_range_column: Option<String>,
    has_membership: bool,
}

impl<'m> NormalizeContext<'m> {
    fn new(model: &'m ModelMeta) -> Self {
        Self {
            model,
            out: NormalizedQuery::default(),
            range_column: None,
            open_range_column: None,
            has_membership: false,
        }
    }

    fn finish(self) -> NormalizedQuery {
        self.out
    }

    fn walk(&mut self, node: &FilterNode, negated: bool) -> Result<()> {
        match node {
            FilterNode::Group {
                connector,
                negated: group_negated,
                children,
            } => {
                let negated = negated ^ *group_negated;
                if !negated && *connector != Connector::And {
                    return Err(QueryError::UnsupportedCombinator);
                }
                for child in children {
                    self.walk(child, negated)?;
                }
                Ok(())
            }
            FilterNode::Leaf(lookup) => self.leaf(lookup, negated),
        }
    }

    fn leaf(&mut self, lookup: &Lookup, negated: bool) -> Result<()> {
        let field = self
            .model
            .field(&lookup.column)
            .ok_or_else(|| QueryError::unknown_column(self.model.name(), &lookup.column))?;
        if matches!(lookup.op, LookupOp::Exact | LookupOp::In | LookupOp::IsNull) {
            self.out.equality_columns.insert(lookup.column.clone());
        }
        if negated {
            self.negated_leaf(field, lookup)
        } else {
            self.positive_leaf(field, lookup)
        }
    }

    fn negated_leaf(&mut self, field: &FieldDescriptor, lookup: &Lookup) -> Result<()> {
        match lookup.op {
            LookupOp::Exact => {
                let value = one(lookup)?.clone();
                if field.primary_key {
                    self.out.excluded_keys.push(value.clone());
                }
                self.push_open_range(&lookup.column, value)
            }
            LookupOp::In => {
                let values = many(lookup)?;
                if field.primary_key {
                    self.out.excluded_keys.extend(values.iter().cloned());
                }
                Err(QueryError::UnsupportedNegatedOperator {
                    operator: lookup.op.name(),
                })
            }
            other => Err(QueryError::UnsupportedNegatedOperator {
                operator: other.name(),
            }),
        }
    }

    fn positive_leaf(&mut self, field: &FieldDescriptor, lookup: &Lookup) -> Result<()> {
        let column = lookup.column.clone();
        match lookup.op {
            LookupOp::Exact => {
                let value = one(lookup)?.clone();
                if field.primary_key {
                    if value.is_null() {
                        self.out.always_empty = true;
                    } else {
                        self.out.included_keys.push(value.clone());
                    }
                }
                self.out.predicates.push(Predicate::Eq { column, value });
            }
            LookupOp::Gt | LookupOp::Gte | LookupOp::Lt | LookupOp::Lte => {
                let value = one(lookup)?.clone();
                self.note_range(&column)?;
                self.out.predicates.push(match lookup.op {
                    LookupOp::Gt => Predicate::Gt { column, value },
                    LookupOp::Gte => Predicate::Ge { column, value },
                    LookupOp::Lt => Predicate::Lt { column, value },
                    _ => Predicate::Le { column, value },
                });
            }
            LookupOp::IsNull => match one(lookup)? {
                Value::Bool(true) => {
                    if field.primary_key {
                        self.out.always_empty = true;
                    }
                    self.out.predicates.push(Predicate::IsNull { column });
                }
                Value::Bool(false) => {
                    self.note_range(&column)?;
                    self.out.predicates.push(Predicate::Gt {
                        column,
                        value: Value::Null,
                    });
                }
                _ => return Err(invalid_operand(lookup)),
            },
            LookupOp::In => {
                let values = many(lookup)?.to_vec();
                if self.open_range_column.is_some() {
                    return Err(QueryError::MultipleInequalityFilters);
                }
                self.has_membership = true;
                if values.is_empty() {
                    self.out.always_empty = true;
                }
                if field.primary_key {
                    self.out.included_keys.extend(values.iter().cloned());
                }
                self.out.predicates.push(Predicate::In { column, values });
            }
            LookupOp::IExact | LookupOp::StartsWith | LookupOp::Year => {
                let value = one(lookup)?.clone();
                let op = SpecialOp::from_lookup(lookup.op).ok_or_else(|| invalid_operand(lookup))?;
                self.out.predicates.push(Predicate::Special { column, op, value });
            }
        }
        Ok(())
    }

    fn note_range(&mut self, column: &str) -> Result<()> {
        let conflicts = |existing: &Option<String>| existing.as_deref().is_some_and(|c| c != column);
        if conflicts(&self.range_column) || conflicts(&self.open_range_column) {
            return Err(QueryError::MultipleInequalityFilters);
        }
        self.range_column = Some(column.to_owned());
        self.out.has_inequality = true;
        Ok(())
    }

    fn push_open_range(&mut self, column: &str, value: Value) -> Result<()> {
        let range_elsewhere = self.range_column.as_deref().is_some_and(|c| c != column);
        if self.open_range_column.is_some() || range_elsewhere || self.has_membership {
            return Err(QueryError::MultipleInequalityFilters);
        }
        self.open_range_column = Some(column.to_owned());
        self.out.has_inequality = true;
        self.out.predicates.push(Predicate::OpenRange {
            column: column.to_owned(),
            value,
        });
        Ok(())
    }
}

fn one(lookup: &Lookup) -> Result<&Value> {
    match (&lookup.operand, lookup.op) {
        (Operand::One(value), op) if op != LookupOp::In => Ok(value),
        _ => Err(invalid_operand(lookup)),
    }
}

fn many(lookup: &Lookup) -> Result<&[Value]> {
    match &lookup.operand {
        Operand::Many(values) => Ok(values),
        Operand::One(_) => Err(invalid_operand(lookup)),
    }
}

fn invalid_operand(lookup: &Lookup) -> QueryError {
    QueryError::InvalidOperand {
        column: lookup.column.clone(),
        operator: lookup.op.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{exact, gt, gte, is_in, is_null, lt, startswith};
    use crate::query::model::{DbType, FieldDescriptor};

    fn task() -> ModelMeta {
        ModelMeta::new("Task", "app_task", FieldDescriptor::primary_key("id", DbType::Integer))
            .with_field(FieldDescriptor::new("status", DbType::String))
            .with_field(FieldDescriptor::new("priority", DbType::Integer))
            .with_field(FieldDescriptor::new("owner", DbType::String).nullable())
    }

    fn run(node: FilterNode) -> Result<NormalizedQuery> {
        normalize(&task(), Some(&node))
    }

    #[test]
    fn and_tree_flattens_in_order() {
        let out = run(FilterNode::and([
            exact("status", "open"),
            FilterNode::and([gte("priority", 3), lt("priority", 9)]),
        ]))
        .expect("normalize");
        assert_eq!(
            out.predicates,
            vec![
                Predicate::Eq {
                    column: "status".into(),
                    value: "open".into()
                },
                Predicate::Ge {
                    column: "priority".into(),
                    value: Value::Int(3)
                },
                Predicate::Lt {
                    column: "priority".into(),
                    value: Value::Int(9)
                },
            ]
        );
        assert!(out.has_inequality);
        assert!(!out.always_empty);
    }

    #[test]
    fn or_outside_negation_is_rejected() {
        let err = run(FilterNode::or([exact("status", "a"), exact("status", "b")])).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedCombinator));
    }

    #[test]
    fn negated_or_becomes_conjunction_of_negations() {
        let err = run(FilterNode::not(FilterNode::or([
            exact("status", "a"),
            exact("owner", "b"),
        ])))
        .unwrap_err();
        // two negated equalities need two open ranges
        assert!(matches!(err, QueryError::MultipleInequalityFilters));

        let out = run(FilterNode::not(FilterNode::or([exact("status", "a")]))).expect("normalize");
        assert_eq!(
            out.predicates,
            vec![Predicate::OpenRange {
                column: "status".into(),
                value: "a".into()
            }]
        );
    }

    #[test]
    fn double_negation_restores_polarity() {
        let out = run(FilterNode::not(FilterNode::not(exact("status", "a")))).expect("normalize");
        assert!(matches!(out.predicates[0], Predicate::Eq { .. }));
        assert!(!out.has_inequality);
    }

    #[test]
    fn negated_pk_equality_records_excluded_key() {
        let out = run(FilterNode::not(exact("id", 7))).expect("normalize");
        assert_eq!(out.excluded_keys, vec![Value::Int(7)]);
        assert!(out.included_keys.is_empty());
        assert!(out.equality_columns.contains("id"));
    }

    #[test]
    fn negated_pk_membership_is_recorded_then_rejected() {
        let model = task();
        let mut ctx = NormalizeContext::new(&model);
        let err = ctx
            .walk(&FilterNode::not(is_in("id", [1, 2])), false)
            .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedNegatedOperator { operator: "in" }));
        assert_eq!(ctx.finish().excluded_keys, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn other_negated_operators_are_rejected() {
        for node in [gt("priority", 1), is_null("owner", true), startswith("status", "o")] {
            let err = run(FilterNode::not(node)).unwrap_err();
            assert!(matches!(err, QueryError::UnsupportedNegatedOperator { .. }), "{err:?}");
        }
    }

    #[test]
    fn null_pk_equality_is_always_empty() {
        assert!(run(exact("id", Value::Null)).expect("normalize").always_empty);
        assert!(run(is_null("id", true)).expect("normalize").always_empty);
        assert!(run(is_in("id", Vec::<Value>::new())).expect("normalize").always_empty);
    }

    #[test]
    fn pk_membership_fills_included_keys() {
        let out = run(FilterNode::and([exact("id", 1), is_in("id", [2, 3])])).expect("normalize");
        assert_eq!(out.included_keys, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn ranges_on_two_columns_conflict() {
        let err = run(FilterNode::and([gt("priority", 1), lt("status", "m")])).unwrap_err();
        assert!(matches!(err, QueryError::MultipleInequalityFilters));
    }

    #[test]
    fn range_and_open_range_on_different_columns_conflict() {
        let err = run(FilterNode::and([
            gt("priority", 1),
            FilterNode::not(exact("status", "done")),
        ]))
        .unwrap_err();
        assert!(matches!(err, QueryError::MultipleInequalityFilters));

        let out = run(FilterNode::and([
            gt("priority", 1),
            FilterNode::not(exact("priority", 5)),
        ]))
        .expect("same column is fine");
        assert_eq!(out.predicates.len(), 2);
    }

    #[test]
    fn membership_and_open_range_conflict_in_either_order() {
        let err = run(FilterNode::and([
            is_in("status", ["a", "b"]),
            FilterNode::not(exact("priority", 1)),
        ]))
        .unwrap_err();
        assert!(matches!(err, QueryError::MultipleInequalityFilters));
        let err = run(FilterNode::and([
            FilterNode::not(exact("priority", 1)),
            is_in("status", ["a", "b"]),
        ]))
        .unwrap_err();
        assert!(matches!(err, QueryError::MultipleInequalityFilters));
    }

    #[test]
    fn not_null_lowers_to_range_over_null() {
        let out = run(is_null("owner", false)).expect("normalize");
        assert_eq!(
            out.predicates,
            vec![Predicate::Gt {
                column: "owner".into(),
                value: Value::Null
            }]
        );
        assert!(out.has_inequality);
    }

    #[test]
    fn operand_shape_is_checked() {
        let err = run(FilterNode::leaf("status", LookupOp::In, "open")).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperand { operator: "in", .. }));
        let err = run(FilterNode::leaf("status", LookupOp::Exact, vec![Value::Int(1)])).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperand { operator: "exact", .. }));
        let err = run(FilterNode::leaf("owner", LookupOp::IsNull, 1)).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperand { .. }));
    }

    #[test]
    fn unknown_column_names_model() {
        let err = run(exact("missing", 1)).unwrap_err();
        assert!(matches!(
            err,
            QueryError::UnknownColumn { ref model, ref column } if model == "Task" && column == "missing"
        ));
    }

    #[test]
    fn empty_filter_normalizes_to_nothing() {
        let out = normalize(&task(), None).expect("normalize");
        assert_eq!(out, NormalizedQuery::default());
    }
}

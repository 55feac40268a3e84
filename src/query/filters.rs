//! In-memory evaluation of store filters and sort orders.
//!
//! Range filters only match values of the bound's type class, except a
//! range over null: `> null` matches every non-null value and is how
//! not-null constraints reach the store.

use std::cmp::Ordering;

use crate::query::{
    datastore::Entity,
    physical::{Direction, Filter, FilterOp, Order},
    value::{compare_values, type_rank, Value},
};

/// True when `entity` satisfies every filter.
pub fn matches_all(entity: &Entity, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| matches(entity, filter))
}

/// True when `entity` satisfies `filter`. Missing properties never match.
pub fn matches(entity: &Entity, filter: &Filter) -> bool {
    let Some(value) = entity.get(&filter.property) else {
        return false;
    };
    if filter.op == FilterOp::Eq {
        return type_rank(value) == type_rank(&filter.value)
            && compare_values(value, &filter.value) == Ordering::Equal;
    }
    if filter.value.is_null() {
        return match filter.op {
            FilterOp::Gt => !value.is_null(),
            FilterOp::Ge => true,
            FilterOp::Lt => false,
            FilterOp::Le | FilterOp::Eq => value.is_null(),
        };
    }
    if type_rank(value) != type_rank(&filter.value) {
        return false;
    }
    let ord = compare_values(value, &filter.value);
    match filter.op {
        FilterOp::Gt => ord == Ordering::Greater,
        FilterOp::Ge => ord != Ordering::Less,
        FilterOp::Lt => ord == Ordering::Less,
        FilterOp::Le => ord != Ordering::Greater,
        FilterOp::Eq => ord == Ordering::Equal,
    }
}

/// Orders entities by `ordering`, then by key. Missing properties sort
/// before any present value.
pub fn compare_entities(left: &Entity, right: &Entity, ordering: &[Order]) -> Ordering {
    for order in ordering {
        let ord = compare_optional(left.get(&order.property), right.get(&order.property));
        let ord = match order.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    compare_values(&left.key, &right.key)
}

fn compare_optional(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(a), Some(b)) => compare_values(a, b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

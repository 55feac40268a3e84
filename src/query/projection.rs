//! Decides when a select can be served by a projection query.
//!
//! Projection queries read values straight from an index, so every projected
//! column must be indexable, and a column constrained by equality cannot be
//! projected.

use std::collections::BTreeSet;

use crate::query::{
    analyze::NormalizedQuery,
    ast::QueryMode,
    errors::{QueryError, Result},
    model::ModelMeta,
};

/// Returns the columns to project, or `None` for a full-entity fetch.
pub fn projection_for(
    model: &ModelMeta,
    requested: &[String],
    mode: QueryMode,
    normalized: &NormalizedQuery,
) -> Result<Option<Vec<String>>> {
    let mut candidates = BTreeSet::new();
    let mut blocked = false;
    for column in requested {
        let field = model
            .field(column)
            .ok_or_else(|| QueryError::unknown_column(model.name(), column))?;
        if field.primary_key {
            continue;
        }
        blocked |= !field.db_type.is_indexable() || normalized.equality_columns.contains(column);
        candidates.insert(column.as_str());
    }
    if blocked || mode != QueryMode::Fetch || candidates.is_empty() || model.has_concrete_parents() {
        return Ok(None);
    }
    Ok(Some(candidates.into_iter().map(str::to_owned).collect()))
}

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::query::datastore::StoreError;
use crate::query::special::RegistryError;

/// Crate-wide result alias for query compilation and execution.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Structured errors raised while compiling or executing a select.
///
/// Construction errors surface before any store call is made. Store errors
/// abort the whole logical query, including every sibling sub-query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// An OR combinator appeared outside of a negated group.
    #[error("OR filters are not supported by the entity store")]
    UnsupportedCombinator,
    /// Only negated equality can be rewritten into store filters.
    #[error("negated '{operator}' filters are not supported")]
    UnsupportedNegatedOperator { operator: &'static str },
    /// The store admits a single inequality-bearing property per query.
    #[error("only one inequality filter per query is supported")]
    MultipleInequalityFilters,
    /// A special operator was used without its auxiliary index.
    #[error(
        "missing special index for {model}.{column} ({operator}); declare \
         '{operator}' for '{column}' under [models.{model}] in the index file"
    )]
    MissingSpecialIndex {
        model: String,
        column: String,
        operator: &'static str,
    },
    /// Column is not declared on the model.
    #[error("unknown column '{column}' on model '{model}'")]
    UnknownColumn { model: String, column: String },
    /// Operand shape does not fit the operator.
    #[error("invalid operand for '{column}__{operator}'")]
    InvalidOperand {
        column: String,
        operator: &'static str,
    },
    /// Cross-product expansion would exceed the configured bound.
    #[error("query expands to {count} sub-queries (max {max})")]
    TooManySubqueries { count: usize, max: usize },
    /// Backing-store failure on any member query.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Special-index declarations could not be loaded.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl QueryError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::UnsupportedCombinator => "UnsupportedCombinator",
            QueryError::UnsupportedNegatedOperator { .. } => "UnsupportedNegatedOperator",
            QueryError::MultipleInequalityFilters => "MultipleInequalityFilters",
            QueryError::MissingSpecialIndex { .. } => "MissingSpecialIndex",
            QueryError::UnknownColumn { .. } => "UnknownColumn",
            QueryError::InvalidOperand { .. } => "InvalidOperand",
            QueryError::TooManySubqueries { .. } => "TooManySubqueries",
            QueryError::Store(err) => err.code(),
            QueryError::Registry(_) => "RegistryError",
        }
    }

    /// True for errors detected before any store call.
    pub fn is_construction_error(&self) -> bool {
        !matches!(self, QueryError::Store(_))
    }

    pub(crate) fn unknown_column(model: &str, column: &str) -> Self {
        QueryError::UnknownColumn {
            model: model.to_owned(),
            column: column.to_owned(),
        }
    }
}

/// Formats query errors prefixed with their codes.
pub struct QueryErrorWithCode<'a>(pub &'a QueryError);

impl fmt::Display for QueryErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_index_message_names_the_index() {
        let err = QueryError::MissingSpecialIndex {
            model: "User".into(),
            column: "email".into(),
            operator: "iexact",
        };
        let text = err.to_string();
        assert!(text.contains("User.email"));
        assert!(text.contains("iexact"));
        assert_eq!(
            QueryErrorWithCode(&err).to_string(),
            format!("[MissingSpecialIndex] {text}")
        );
    }

    #[test]
    fn store_errors_keep_their_code() {
        let err = QueryError::from(StoreError::Unavailable("down".into()));
        assert_eq!(err.code(), "StoreUnavailable");
        assert!(!err.is_construction_error());
        assert!(QueryError::MultipleInequalityFilters.is_construction_error());
    }
}

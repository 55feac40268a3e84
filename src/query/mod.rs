#![forbid(unsafe_code)]

//! Select translation and multi-query execution.
//!
//! A [`SelectQuery`](ast::SelectQuery) flows through the planner into a
//! [`CompiledQuery`](planner::CompiledQuery) and then through the executor
//! into a [`QueryOutput`](executor::QueryOutput).

/// Filter trees, lookups, and the select input.
pub mod ast;

/// Fluent construction of selects.
pub mod builder;

/// Entity cache consulted for unique lookups.
pub mod cache;

/// Backing-store boundary and the in-memory reference store.
pub mod datastore;

/// Error types and codes.
pub mod errors;

/// Select execution, fan-out, and merging.
pub mod executor;

/// In-memory evaluation of store filters.
pub mod filters;

/// Model metadata.
pub mod model;

/// Planner and executor options.
pub mod options;

/// Physical query units.
pub mod physical;

/// Compile pipeline and explain output.
pub mod planner;

/// Performance profiling for the query pipeline.
pub mod profile;

/// Projection feasibility.
pub mod projection;

/// Special operators and their index registry.
pub mod special;

/// Unique-lookup detection and cache keys.
pub mod unique;

/// Scalar values.
pub mod value;

/// Filter-tree normalization.
pub mod analyze;

pub use builder::QueryBuilder;
pub use errors::{QueryError, Result};
pub use executor::{Executor, QueryOutput, ResultStream};
pub use planner::{CompiledQuery, PlanExplain, Planner};
pub use value::Value;

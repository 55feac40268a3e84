//! Translation of relational-style selects into queries a restrictive entity
//! store can run, and execution of the resulting query sets.

#![warn(missing_docs)]

pub mod logging;
pub mod query;

pub use query::{
    datastore::{Datastore, Entity, MemoryDatastore},
    model::{DbType, FieldDescriptor, ModelMeta},
    options::QueryOptions,
    CompiledQuery, Executor, Planner, QueryBuilder, QueryError, QueryOutput,
};

//! Special lookup operators backed by auxiliary indexed columns.
//!
//! The store cannot evaluate case-insensitive equality, prefix matches, or
//! date-part extraction. Instead, each provisioned `(model, column, op)` has
//! a derived column `_idx_<op>_<column>` written alongside the entity, and a
//! special lookup is rewritten into plain equality on that column with the
//! operand passed through the same transform used at write time.
//!
//! Which indexes exist is owned by a [`SpecialIndexRegistry`]. The in-memory
//! registry can be declared in code or loaded from a TOML file:
//!
//! ```toml
//! [models.User]
//! email = ["iexact", "startswith"]
//! created = ["year"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::query::ast::LookupOp;
use crate::query::value::Value;

/// Lookup operators that need an auxiliary index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpecialOp {
    /// Case-insensitive equality.
    IExact,
    /// Prefix match.
    StartsWith,
    /// Calendar year of a datetime.
    Year,
}

impl SpecialOp {
    /// Lookup name used in index declarations and column names.
    pub fn name(self) -> &'static str {
        match self {
            SpecialOp::IExact => "iexact",
            SpecialOp::StartsWith => "startswith",
            SpecialOp::Year => "year",
        }
    }

    /// Parses a lookup name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "iexact" => Some(SpecialOp::IExact),
            "startswith" => Some(SpecialOp::StartsWith),
            "year" => Some(SpecialOp::Year),
            _ => None,
        }
    }

    /// Special operator carried by a lookup, if any.
    pub fn from_lookup(op: LookupOp) -> Option<Self> {
        match op {
            LookupOp::IExact => Some(SpecialOp::IExact),
            LookupOp::StartsWith => Some(SpecialOp::StartsWith),
            LookupOp::Year => Some(SpecialOp::Year),
            _ => None,
        }
    }

    /// Name of the derived column holding this index for `column`.
    pub fn indexed_column(self, column: &str) -> String {
        format!("_idx_{}_{column}", self.name())
    }

    /// Transform applied to operands (and to stored values at write time).
    pub fn transform(self) -> ValueTransform {
        match self {
            SpecialOp::IExact => ValueTransform::Lowercase,
            SpecialOp::StartsWith => ValueTransform::Identity,
            SpecialOp::Year => ValueTransform::Year,
        }
    }

    /// Fully described index for `column`.
    pub fn index_for(self, column: &str) -> SpecialIndex {
        SpecialIndex {
            indexed_column: self.indexed_column(column),
            transform: self.transform(),
        }
    }
}

impl fmt::Display for SpecialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operand rewrite applied before querying an auxiliary column.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueTransform {
    /// Strings are lowercased; other values pass through.
    Lowercase,
    /// Value passes through unchanged.
    Identity,
    /// Datetimes become their UTC calendar year; integers pass through.
    Year,
}

impl ValueTransform {
    /// Applies the transform. Returns `None` when the value cannot be
    /// converted.
    pub fn apply(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ValueTransform::Lowercase, Value::String(s)) => Some(Value::String(s.to_lowercase())),
            (ValueTransform::Lowercase, other) | (ValueTransform::Identity, other) => {
                Some(other.clone())
            }
            (ValueTransform::Year, Value::Int(year)) => Some(Value::Int(*year)),
            (ValueTransform::Year, Value::DateTime(nanos)) => OffsetDateTime::from_unix_timestamp_nanos(*nanos)
                .ok()
                .map(|dt| Value::Int(i64::from(dt.year()))),
            (ValueTransform::Year, _) => None,
        }
    }
}

/// A provisioned auxiliary index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpecialIndex {
    /// Derived column to filter on.
    pub indexed_column: String,
    /// Operand transform.
    pub transform: ValueTransform,
}

/// Source of truth for provisioned special indexes.
pub trait SpecialIndexRegistry: Send + Sync {
    /// Returns the index for `(model, column, op)` when it is provisioned.
    fn resolve(&self, model: &str, column: &str, op: SpecialOp) -> Option<SpecialIndex>;
}

/// Registry with nothing provisioned.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoSpecialIndexes;

impl SpecialIndexRegistry for NoSpecialIndexes {
    fn resolve(&self, _model: &str, _column: &str, _op: SpecialOp) -> Option<SpecialIndex> {
        None
    }
}

/// Errors raised while loading or saving index declarations.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum RegistryError {
    #[error("failed to read index declarations {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse index declarations: {source}")]
    Parse { source: toml::de::Error },
    #[error("failed to serialize index declarations: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write index declarations {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown special operator '{operator}' declared for {model}.{column}")]
    UnknownOperator {
        model: String,
        column: String,
        operator: String,
    },
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawIndexFile {
    #[serde(default)]
    models: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

/// Registry held in memory, declared in code or loaded from TOML.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIndexRegistry {
    provisioned: BTreeMap<String, BTreeMap<String, BTreeSet<SpecialOp>>>,
}

impl InMemoryIndexRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one provisioned index.
    pub fn with_index(mut self, model: impl Into<String>, column: impl Into<String>, op: SpecialOp) -> Self {
        self.provisioned
            .entry(model.into())
            .or_default()
            .entry(column.into())
            .or_default()
            .insert(op);
        self
    }

    /// Parses declarations from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        let raw: RawIndexFile = toml::from_str(text).map_err(|source| RegistryError::Parse { source })?;
        let mut registry = Self::new();
        for (model, columns) in raw.models {
            for (column, ops) in columns {
                for op in ops {
                    let parsed = SpecialOp::parse(&op).ok_or_else(|| RegistryError::UnknownOperator {
                        model: model.clone(),
                        column: column.clone(),
                        operator: op.clone(),
                    })?;
                    registry = registry.with_index(model.clone(), column.clone(), parsed);
                }
            }
        }
        Ok(registry)
    }

    /// Reads declarations from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders declarations as TOML.
    pub fn to_toml_string(&self) -> Result<String, RegistryError> {
        let raw = RawIndexFile {
            models: self
                .provisioned
                .iter()
                .map(|(model, columns)| {
                    let columns = columns
                        .iter()
                        .map(|(column, ops)| {
                            (column.clone(), ops.iter().map(|op| op.name().to_owned()).collect())
                        })
                        .collect();
                    (model.clone(), columns)
                })
                .collect(),
        };
        toml::to_string_pretty(&raw).map_err(|source| RegistryError::Serialize { source })
    }

    /// Writes declarations to a TOML file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let path = path.as_ref();
        let serialized = self.to_toml_string()?;
        fs::write(path, serialized).map_err(|source| RegistryError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Number of provisioned `(model, column, op)` triples.
    pub fn len(&self) -> usize {
        self.provisioned
            .values()
            .flat_map(|columns| columns.values())
            .map(BTreeSet::len)
            .sum()
    }

    /// True when nothing is provisioned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpecialIndexRegistry for InMemoryIndexRegistry {
    fn resolve(&self, model: &str, column: &str, op: SpecialOp) -> Option<SpecialIndex> {
        self.provisioned
            .get(model)?
            .get(column)?
            .contains(&op)
            .then(|| op.index_for(column))
    }
}

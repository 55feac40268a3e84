//! Model metadata consumed by the compile pipeline.
//!
//! A [`ModelMeta`] describes one domain model: its table, its primary key, the
//! declared fields and their storage types, uniqueness constraints, and the
//! concrete inheritance chain. Column lookups go through a [`FieldMap`] built
//! once when the model is declared.

use rustc_hash::FxHashMap;

/// Storage type of a declared field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DbType {
    /// Short indexed string.
    String,
    /// Long text; never indexed by the store.
    Text,
    /// Raw bytes; never indexed by the store.
    Bytes,
    /// Signed integer.
    Integer,
    /// Floating point.
    Float,
    /// Boolean.
    Boolean,
    /// Timestamp stored as nanoseconds since epoch.
    DateTime,
    /// Reference to another entity's key.
    Key,
}

impl DbType {
    /// Whether the store can serve this type from an index (and so project it).
    pub fn is_indexable(self) -> bool {
        !matches!(self, DbType::Text | DbType::Bytes)
    }
}

/// Declaration of a single column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Column name as used in filters.
    pub column: String,
    /// Storage type.
    pub db_type: DbType,
    /// Marks the primary key.
    pub primary_key: bool,
    /// Single-column uniqueness constraint.
    pub unique: bool,
    /// Whether null is a legal stored value.
    pub nullable: bool,
}

impl FieldDescriptor {
    /// Plain non-unique, non-null column.
    pub fn new(column: impl Into<String>, db_type: DbType) -> Self {
        Self {
            column: column.into(),
            db_type,
            primary_key: false,
            unique: false,
            nullable: false,
        }
    }

    /// Primary-key column. Primary keys are implicitly unique.
    pub fn primary_key(column: impl Into<String>, db_type: DbType) -> Self {
        Self {
            primary_key: true,
            unique: true,
            ..Self::new(column, db_type)
        }
    }

    /// Marks the column unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Column name to descriptor map, preserving declaration order.
#[derive(Clone, Debug, Default)]
pub struct FieldMap {
    by_column: FxHashMap<String, usize>,
    fields: Vec<FieldDescriptor>,
}

impl FieldMap {
    fn insert(&mut self, field: FieldDescriptor) {
        match self.by_column.get(&field.column) {
            Some(&idx) => self.fields[idx] = field,
            None => {
                self.by_column.insert(field.column.clone(), self.fields.len());
                self.fields.push(field);
            }
        }
    }

    /// Looks up a column.
    pub fn get(&self, column: &str) -> Option<&FieldDescriptor> {
        self.by_column.get(column).map(|&idx| &self.fields[idx])
    }

    /// Fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no field has been declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Metadata for a single model.
#[derive(Clone, Debug)]
pub struct ModelMeta {
    name: String,
    table: String,
    pk_column: String,
    fields: FieldMap,
    unique_together: Vec<Vec<String>>,
    parents: Vec<String>,
    proxy: bool,
    default_ordering: Vec<String>,
}

impl ModelMeta {
    /// Declares a model with its primary-key field.
    pub fn new(name: impl Into<String>, table: impl Into<String>, pk: FieldDescriptor) -> Self {
        let pk = FieldDescriptor {
            primary_key: true,
            unique: true,
            ..pk
        };
        let mut fields = FieldMap::default();
        let pk_column = pk.column.clone();
        fields.insert(pk);
        Self {
            name: name.into(),
            table: table.into(),
            pk_column,
            fields,
            unique_together: Vec::new(),
            parents: Vec::new(),
            proxy: false,
            default_ordering: Vec::new(),
        }
    }

    /// Adds a non-key field.
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        let field = FieldDescriptor {
            primary_key: false,
            ..field
        };
        if field.column != self.pk_column {
            self.fields.insert(field);
        }
        self
    }

    /// Adds a multi-column uniqueness constraint.
    pub fn with_unique_together<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_together
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Appends a concrete ancestor table. Declare nearest first; the last one
    /// is the inheritance root.
    pub fn with_parent(mut self, table: impl Into<String>) -> Self {
        self.parents.push(table.into());
        self
    }

    /// Marks the model as a proxy of its parent.
    pub fn as_proxy(mut self) -> Self {
        self.proxy = true;
        self
    }

    /// Ordering applied when a query requests none. `-col` sorts descending.
    pub fn with_default_ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_ordering = ordering.into_iter().map(Into::into).collect();
        self
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table declared by the model itself.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Primary-key column.
    pub fn pk_column(&self) -> &str {
        &self.pk_column
    }

    /// Declared fields.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Looks up a declared column.
    pub fn field(&self, column: &str) -> Option<&FieldDescriptor> {
        self.fields.get(column)
    }

    /// True when `column` is the primary key.
    pub fn is_pk(&self, column: &str) -> bool {
        column == self.pk_column
    }

    /// True for proxy models.
    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    /// Default ordering entries.
    pub fn default_ordering(&self) -> &[String] {
        &self.default_ordering
    }

    /// True when rows of this model live in an ancestor's table.
    pub fn has_concrete_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    /// Table that physically stores rows of this model.
    pub fn root_table(&self) -> &str {
        self.parents.last().map(String::as_str).unwrap_or(&self.table)
    }

    /// Column sets that identify at most one row: `unique_together` groups
    /// first, then each unique column on its own (primary key included).
    pub fn unique_combinations(&self) -> Vec<Vec<String>> {
        let mut combos = self.unique_together.clone();
        combos.extend(
            self.fields
                .iter()
                .filter(|field| field.unique)
                .map(|field| vec![field.column.clone()]),
        );
        combos
    }
}

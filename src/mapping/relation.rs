//! Relation descriptors - how one named property of a type is stored

use crate::{Error, Result};
use crate::value::ColumnType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;

/// Storage kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// Plain value in a column of the type's own table
    Scalar,
    /// Many-to-one link; the column holds the target's join-column value
    Reference,
    /// One-to-many or many-to-many set of child nodes
    Collection,
    /// In-memory aggregate, never persisted
    Virtual,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Scalar => "scalar",
            RelationKind::Reference => "reference",
            RelationKind::Collection => "collection",
            RelationKind::Virtual => "virtual",
        }
    }

    /// Whether properties of this kind occupy a column of the owning table
    pub fn has_column(&self) -> bool {
        matches!(self, RelationKind::Scalar | RelationKind::Reference)
    }
}

impl FromStr for RelationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "scalar" | "column" | "value" => Ok(RelationKind::Scalar),
            "reference" | "ref" | "object" => Ok(RelationKind::Reference),
            "collection" | "children" | "list" => Ok(RelationKind::Collection),
            "virtual" | "transient" => Ok(RelationKind::Virtual),
            _ => Err(Error::Config(format!("Unknown relation kind: {}", s))),
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Explicit join table backing a many-to-many collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    /// Join table name
    pub table: String,
    /// Column holding the parent id
    pub parent_column: String,
    /// Column holding the child id
    pub child_column: String,
    /// Optional explicit position of the child within the parent's collection
    pub order_column: Option<String>,
}

/// How many targets a relation reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cardinality {
    One,
    OneToMany,
    ManyToMany(JoinTable),
}

/// Table and id column of a relation's target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub table: String,
    pub id_column: String,
}

/// Immutable descriptor of how one property is stored.
///
/// The storage type is resolved exactly once, by the first `DbColumn`
/// constructed against the relation.
#[derive(Debug)]
pub struct Relation {
    property: String,
    kind: RelationKind,
    column: Option<String>,
    target_type: Option<String>,
    target_table: Option<TargetTable>,
    join_column: Option<String>,
    filter: Option<String>,
    order_by: Option<String>,
    cardinality: Cardinality,
    eager: bool,
    column_type: OnceLock<ColumnType>,
}

impl Relation {
    fn base(property: impl Into<String>, kind: RelationKind, cardinality: Cardinality) -> Self {
        Self {
            property: property.into(),
            kind,
            column: None,
            target_type: None,
            target_table: None,
            join_column: None,
            filter: None,
            order_by: None,
            cardinality,
            eager: false,
            column_type: OnceLock::new(),
        }
    }

    /// A scalar property stored in `column`
    pub fn scalar(property: impl Into<String>, column: impl Into<String>) -> Self {
        let mut rel = Self::base(property, RelationKind::Scalar, Cardinality::One);
        rel.column = Some(column.into());
        rel
    }

    /// A many-to-one reference stored in `column`, pointing at `target`
    pub fn reference(property: impl Into<String>, column: impl Into<String>, target: impl Into<String>) -> Self {
        let mut rel = Self::base(property, RelationKind::Reference, Cardinality::One);
        rel.column = Some(column.into());
        rel.target_type = Some(target.into());
        rel
    }

    /// A one-to-many collection: children of type `target` whose
    /// `join_column` holds the parent's id
    pub fn collection(property: impl Into<String>, target: impl Into<String>, join_column: impl Into<String>) -> Self {
        let mut rel = Self::base(property, RelationKind::Collection, Cardinality::OneToMany);
        rel.target_type = Some(target.into());
        rel.join_column = Some(join_column.into());
        rel
    }

    /// A many-to-many collection through an explicit join table
    pub fn many_to_many(property: impl Into<String>, target: impl Into<String>, join_table: JoinTable) -> Self {
        let mut rel = Self::base(property, RelationKind::Collection, Cardinality::ManyToMany(join_table));
        rel.target_type = Some(target.into());
        rel
    }

    /// A purely in-memory collection
    pub fn virtual_collection(property: impl Into<String>) -> Self {
        Self::base(property, RelationKind::Virtual, Cardinality::OneToMany)
    }

    /// Set the static filter expression
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the order-by expression
    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// Match references against `join_column` on the target instead of its id
    pub fn with_join_column(mut self, join_column: impl Into<String>) -> Self {
        self.join_column = Some(join_column.into());
        self
    }

    /// Record where the target type is stored
    pub fn with_target_table(mut self, table: impl Into<String>, id_column: impl Into<String>) -> Self {
        self.target_table = Some(TargetTable {
            table: table.into(),
            id_column: id_column.into(),
        });
        self
    }

    /// Prefetch the target when the owner is loaded
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn target_type(&self) -> Option<&str> {
        self.target_type.as_deref()
    }

    pub fn target_table(&self) -> Option<&TargetTable> {
        self.target_table.as_ref()
    }

    pub fn join_column(&self) -> Option<&str> {
        self.join_column.as_deref()
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn cardinality(&self) -> &Cardinality {
        &self.cardinality
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// Storage type, once a column has been built against this relation
    pub fn column_type(&self) -> Option<ColumnType> {
        self.column_type.get().copied()
    }

    /// Whether the relation is flushed to storage at commit
    pub fn is_persistent(&self) -> bool {
        self.kind != RelationKind::Virtual
    }

    /// Fix the storage type of this relation.
    ///
    /// The first call wins; any later call with a different type fails with
    /// `SchemaConflict`. Safe to race from several threads.
    pub(crate) fn resolve_column_type(&self, ty: ColumnType) -> Result<()> {
        let resolved = *self.column_type.get_or_init(|| ty);
        if resolved != ty {
            return Err(Error::SchemaConflict(format!(
                "relation {} already resolved to {}, cannot use {}",
                self.property, resolved, ty
            )));
        }
        Ok(())
    }
}

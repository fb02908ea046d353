//! Physical column descriptors

use crate::Result;
use crate::value::ColumnType;
use super::relation::Relation;
use std::sync::Arc;

/// Name and storage type of one column in a relational table.
#[derive(Debug, Clone)]
pub struct DbColumn {
    name: String,
    column_type: ColumnType,
    relation: Option<Arc<Relation>>,
}

impl DbColumn {
    /// Create a column descriptor.
    ///
    /// When `relation` is given, the column's type is pushed into it. A
    /// relation that already resolved to a different type makes this fail
    /// with `SchemaConflict`.
    pub fn new(name: impl Into<String>, column_type: ColumnType, relation: Option<Arc<Relation>>) -> Result<Self> {
        if let Some(rel) = &relation {
            rel.resolve_column_type(column_type)?;
        }
        Ok(Self {
            name: name.into(),
            column_type,
            relation,
        })
    }

    /// Get the column name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get this column's storage type
    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// The relation backed by this column, if any
    pub fn relation(&self) -> Option<&Arc<Relation>> {
        self.relation.as_ref()
    }
}
